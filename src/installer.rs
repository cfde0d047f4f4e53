use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Serialize;

use crate::command::{CommandSpec, Executor};
use crate::config::ProvisionConfig;
use crate::domain::{InstalledArtifact, PostInstallStep, Resource, Version};
use crate::error::KiraError;
use crate::fallback::FallbackEngine;
use crate::fetch::Retriever;
use crate::fs_util;
use crate::store::{DefaultSwitch, InstallStore};
use crate::template::{self, TemplateVars};

/// How an already-present install was recognised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum ProbeHit {
    Layout { path: String },
    Binary { program: String, reported: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InstallOutcome {
    Present {
        version: String,
        hit: ProbeHit,
    },
    Installed {
        version: String,
        path: String,
        source: String,
        default: DefaultSwitch,
        removed: Vec<String>,
    },
    /// Every attempt came up empty and none was mandatory.
    Unavailable { version: String },
    Planned {
        version: String,
        attempts: Vec<String>,
    },
}

/// Runs `body` only when `probe` reports nothing usable.
pub fn install_once<T, P, B>(probe: P, body: B) -> Result<T, KiraError>
where
    P: FnOnce() -> Result<Option<T>, KiraError>,
    B: FnOnce() -> Result<T, KiraError>,
{
    match probe()? {
        Some(found) => Ok(found),
        None => body(),
    }
}

#[derive(Debug, Clone)]
pub struct InstallRequest<'a> {
    pub resource: &'a Resource,
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub resource: String,
    pub category: String,
    pub mandatory: bool,
    pub outcome: Option<InstallOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
    first_mandatory: Option<KiraError>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|item| item.error.is_some()).count()
    }

    /// First failure of a mandatory resource, if any.
    pub fn first_mandatory_failure(&self) -> Option<&KiraError> {
        self.first_mandatory.as_ref()
    }
}

pub struct InstallDispatcher<'a> {
    config: &'a ProvisionConfig,
    store: &'a InstallStore,
    retriever: &'a dyn Retriever,
    executor: &'a dyn Executor,
}

impl<'a> InstallDispatcher<'a> {
    pub fn new(
        config: &'a ProvisionConfig,
        store: &'a InstallStore,
        retriever: &'a dyn Retriever,
        executor: &'a dyn Executor,
    ) -> Self {
        Self {
            config,
            store,
            retriever,
            executor,
        }
    }

    pub fn ensure_installed(
        &self,
        resource: &Resource,
        requested: Option<&Version>,
    ) -> Result<InstallOutcome, KiraError> {
        let version = resource.resolve_version(requested)?;
        install_once(
            || self.probe(resource, &version),
            || self.install(resource, &version),
        )
    }

    /// Installs every request in order. A failure is recorded and the batch
    /// moves on; the first mandatory failure is kept for the caller.
    pub fn install_batch<F>(&self, requests: &[InstallRequest<'_>], mut on_item: F) -> BatchReport
    where
        F: FnMut(&BatchItem),
    {
        let mut report = BatchReport::default();
        for request in requests {
            let resource = request.resource;
            let result = self.ensure_installed(resource, request.version.as_ref());
            let (outcome, error) = match result {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => {
                    tracing::error!(resource = %resource.name, error = %err, "install failed");
                    let message = err.to_string();
                    if resource.mandatory && report.first_mandatory.is_none() {
                        report.first_mandatory = Some(err);
                    }
                    (None, Some(message))
                }
            };
            let item = BatchItem {
                resource: resource.name.to_string(),
                category: resource.category.clone(),
                mandatory: resource.mandatory,
                outcome,
                error,
            };
            on_item(&item);
            report.items.push(item);
        }
        report
    }

    fn probe(
        &self,
        resource: &Resource,
        version: &Version,
    ) -> Result<Option<InstallOutcome>, KiraError> {
        let name = resource.name.as_str();
        let newest = self
            .store
            .installed_versions(&resource.category, name)?
            .into_iter()
            .filter(|installed| installed >= version)
            .max();
        if let Some(found) = newest {
            let path = self.store.version_dir(&resource.category, name, &found);
            tracing::debug!(resource = name, version = %found, "present in layout");
            return Ok(Some(InstallOutcome::Present {
                version: found.to_string(),
                hit: ProbeHit::Layout {
                    path: path.to_string(),
                },
            }));
        }

        let Some(probe) = &resource.probe else {
            return Ok(None);
        };
        if !self.executor.has_tool(&probe.name) {
            return Ok(None);
        }
        let Some(pattern) = probe.version_pattern.as_deref() else {
            return Ok(Some(InstallOutcome::Present {
                version: version.to_string(),
                hit: ProbeHit::Binary {
                    program: probe.name.clone(),
                    reported: None,
                },
            }));
        };

        let args = if probe.version_args.is_empty() {
            vec!["--version".to_string()]
        } else {
            probe.version_args.clone()
        };
        let spec = CommandSpec::new(probe.name.as_str(), args)?;
        let output = match self.executor.run(&spec) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(resource = name, error = %err, "version probe failed");
                return Ok(None);
            }
        };
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let Some(reported) = reported_version(pattern, &combined)? else {
            return Ok(None);
        };
        match reported.parse::<Version>() {
            Ok(found) if &found >= version => Ok(Some(InstallOutcome::Present {
                version: found.to_string(),
                hit: ProbeHit::Binary {
                    program: probe.name.clone(),
                    reported: Some(reported),
                },
            })),
            _ => Ok(None),
        }
    }

    fn install(&self, resource: &Resource, version: &Version) -> Result<InstallOutcome, KiraError> {
        let name = resource.name.as_str();
        let category = resource.category.as_str();
        let version_dir = self.store.version_dir(category, name, version);
        let vars = TemplateVars::host_defaults()
            .with("name", name)
            .with("version", version.as_str())
            .with("category", category)
            .with("target", self.config.target.as_str())
            .with("install_dir", version_dir.as_str());
        let engine = FallbackEngine::new(
            self.retriever,
            self.executor,
            &self.config.work_root,
            &self.config.host,
        );

        if self.config.dry_run {
            let attempts = engine
                .plan(&resource.attempts, &vars)?
                .into_iter()
                .map(|plan| format!("{} {}", plan.strategy, plan.url))
                .collect();
            return Ok(InstallOutcome::Planned {
                version: version.to_string(),
                attempts,
            });
        }

        let mut removed = self.store.remove_older_than(category, name, version)?;

        let staged = engine.acquire_with(name, &resource.attempts, &vars, |acquired| {
            let staging = self.store.staging_dir(category, name)?;
            let tree = staging.path().join("tree");
            stage_artifact(&acquired.path, &tree)?;
            run_post_install(&resource.post_install, &tree, &vars)?;
            let path = self.store.commit_version(&tree, category, name, version)?;
            Ok((path, acquired.url.clone()))
        })?;
        let Some((path, source)) = staged else {
            return Ok(InstallOutcome::Unavailable {
                version: version.to_string(),
            });
        };

        self.store.write_marker(&InstalledArtifact {
            resource_name: name.to_string(),
            category: category.to_string(),
            version: version.clone(),
            install_path: path.clone(),
            is_default: false,
            installed_at: Some(chrono::Utc::now().to_rfc3339()),
            source: Some(source.clone()),
        })?;
        let default = self.store.set_default(category, name, version, false)?;
        removed.extend(self.store.remove_older_than(category, name, version)?);
        tracing::info!(resource = name, version = %version, path = %path, "installed");

        Ok(InstallOutcome::Installed {
            version: version.to_string(),
            path: path.to_string(),
            source,
            default,
            removed: removed.iter().map(ToString::to_string).collect(),
        })
    }
}

fn reported_version(pattern: &str, output: &str) -> Result<Option<String>, KiraError> {
    let regex = Regex::new(pattern)
        .map_err(|err| KiraError::InvalidCatalog(format!("probe pattern {pattern}: {err}")))?;
    Ok(regex.captures(output).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().trim().to_string())
    }))
}

/// Moves a fetched file or tree to `tree`, which becomes the version directory.
fn stage_artifact(artifact: &Path, tree: &Path) -> Result<(), KiraError> {
    if artifact.is_dir() {
        return fs_util::move_path(artifact, tree);
    }
    let file_name = artifact
        .file_name()
        .ok_or_else(|| KiraError::Filesystem("artifact has no file name".to_string()))?;
    fs::create_dir_all(tree).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    fs_util::move_path(artifact, &tree.join(file_name))
}

/// Joins a catalog-supplied relative path onto `root`, refusing escapes.
fn contained(root: &Path, relative: &str) -> Result<PathBuf, KiraError> {
    let relative = Path::new(relative);
    let escapes = relative.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || relative.as_os_str().is_empty() {
        return Err(KiraError::InvalidCatalog(format!(
            "post-install path must stay inside the install directory: {}",
            relative.display()
        )));
    }
    Ok(root.join(relative))
}

pub fn run_post_install(
    steps: &[PostInstallStep],
    root: &Path,
    vars: &TemplateVars,
) -> Result<(), KiraError> {
    for step in steps {
        match step {
            PostInstallStep::Move { from, to } => {
                let from = contained(root, &template::expand(from, vars)?)?;
                let to = contained(root, &template::expand(to, vars)?)?;
                fs_util::move_path(&from, &to)?;
            }
            PostInstallStep::Chmod { path, mode } => {
                let path = contained(root, &template::expand(path, vars)?)?;
                let mode = u32::from_str_radix(mode, 8).map_err(|_| {
                    KiraError::InvalidCatalog(format!("invalid chmod mode {mode}"))
                })?;
                set_mode(&path, mode)?;
            }
            PostInstallStep::EnvFile { path, vars: env } => {
                let path = contained(root, &template::expand(path, vars)?)?;
                let mut content = String::new();
                for (key, value) in env {
                    let value = template::expand(value, vars)?;
                    content.push_str(&format!("export {key}=\"{}\"\n", value.replace('"', "\\\"")));
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
                }
                fs::write(&path, content).map_err(|err| KiraError::Filesystem(err.to_string()))?;
            }
            PostInstallStep::Symlink { target, link } => {
                let target = template::expand(target, vars)?;
                let link = contained(root, &template::expand(link, vars)?)?;
                if let Some(parent) = link.parent() {
                    fs::create_dir_all(parent).map_err(|err| KiraError::Filesystem(err.to_string()))?;
                }
                if link.symlink_metadata().is_ok() {
                    fs::remove_file(&link).map_err(|err| KiraError::Filesystem(err.to_string()))?;
                }
                symlink(Path::new(&target), &link)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), KiraError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| KiraError::Filesystem(format!("chmod {}: {err}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), KiraError> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn symlink(target: &Path, link: &Path) -> Result<(), KiraError> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|err| KiraError::Filesystem(format!("symlink {}: {err}", link.display())))
}

#[cfg(not(unix))]
pub(crate) fn symlink(target: &Path, link: &Path) -> Result<(), KiraError> {
    let source = link.parent().map(|dir| dir.join(target)).unwrap_or_else(|| target.to_path_buf());
    fs::copy(&source, link)
        .map(|_| ())
        .map_err(|err| KiraError::Filesystem(format!("copy {}: {err}", link.display())))
}
