use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::KiraError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern"));

pub const KNOWN_PLACEHOLDERS: &[&str] = &[
    "name",
    "version",
    "category",
    "target",
    "arch",
    "organism",
    "genome",
    "bundle",
    "accession",
    "install_dir",
];

/// Values substituted into `{placeholder}` slots of URL and path templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    pub fn host_defaults() -> Self {
        Self::new()
            .with("target", std::env::consts::OS)
            .with("arch", std::env::consts::ARCH)
    }
}

pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Rejects templates naming placeholders nothing ever supplies.
pub fn validate(template: &str) -> Result<(), KiraError> {
    if template.trim().is_empty() {
        return Err(KiraError::InvalidTemplate {
            template: template.to_string(),
            message: "empty template".to_string(),
        });
    }
    for name in placeholders(template) {
        if !KNOWN_PLACEHOLDERS.contains(&name.as_str()) {
            return Err(KiraError::InvalidTemplate {
                template: template.to_string(),
                message: format!("unknown placeholder {{{name}}}"),
            });
        }
    }
    Ok(())
}

pub fn expand(template: &str, vars: &TemplateVars) -> Result<String, KiraError> {
    let mut missing = None;
    let expanded = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match vars.values.get(key) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    if let Some(key) = missing {
        return Err(KiraError::InvalidTemplate {
            template: template.to_string(),
            message: format!("no value for {{{key}}}"),
        });
    }
    Ok(expanded.into_owned())
}
