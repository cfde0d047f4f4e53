use std::fmt;

use serde::Serialize;

use crate::config::BundleSources;
use crate::domain::{AcquisitionAttempt, FetchHook, StrategyKind};
use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Dbsnp,
    Rnaseq,
}

impl BundleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleKind::Dbsnp => "dbsnp",
            BundleKind::Rnaseq => "rnaseq",
        }
    }

    /// Directory under the genome root the bundle unpacks into.
    pub fn dir_name(&self) -> &'static str {
        match self {
            BundleKind::Dbsnp => "variation",
            BundleKind::Rnaseq => "rnaseq",
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", content = "url", rename_all = "snake_case")]
pub enum BundleRoute {
    Override(String),
    Generic(String),
    Unconfigured,
}

/// An organism override is used on its own; the generic template only applies
/// to organisms without one.
pub fn route(sources: &BundleSources, organism: &str) -> BundleRoute {
    if let Some(url) = sources.overrides.get(organism) {
        return BundleRoute::Override(url.clone());
    }
    match &sources.base {
        Some(base) => BundleRoute::Generic(base.clone()),
        None => BundleRoute::Unconfigured,
    }
}

/// Single non-mandatory attempt for the routed source, unpacked on arrival.
pub fn attempts(route: &BundleRoute) -> Result<Vec<AcquisitionAttempt>, KiraError> {
    let url = match route {
        BundleRoute::Override(url) | BundleRoute::Generic(url) => url,
        BundleRoute::Unconfigured => return Ok(Vec::new()),
    };
    let strategy = StrategyKind::from_url(url)
        .ok_or_else(|| KiraError::InvalidCatalog(format!("cannot infer strategy for {url}")))?;
    let mut attempt = AcquisitionAttempt::new(strategy, url.clone(), false);
    attempt.post_fetch = vec![FetchHook::Unpack];
    Ok(vec![attempt])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn sources() -> BundleSources {
        BundleSources {
            base: Some("s3://biodata/genomes/{genome}/{bundle}.tar.gz".to_string()),
            overrides: BTreeMap::from([(
                "Scerevisiae".to_string(),
                "https://yeast.example.org/{genome}/{bundle}.tar.gz".to_string(),
            )]),
        }
    }

    #[test]
    fn override_wins_exclusively() {
        let route = route(&sources(), "Scerevisiae");
        assert_eq!(
            route,
            BundleRoute::Override("https://yeast.example.org/{genome}/{bundle}.tar.gz".to_string())
        );
        let planned = attempts(&route).unwrap();
        assert_eq!(planned.len(), 1);
        assert!(!planned[0].mandatory);
        assert_eq!(planned[0].strategy, StrategyKind::Http);
    }

    #[test]
    fn generic_for_other_organisms() {
        assert_eq!(
            route(&sources(), "Hsapiens"),
            BundleRoute::Generic("s3://biodata/genomes/{genome}/{bundle}.tar.gz".to_string())
        );
        assert_eq!(
            route(&BundleSources::default(), "Hsapiens"),
            BundleRoute::Unconfigured
        );
    }
}
