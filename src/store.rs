use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::TempDir;

use crate::domain::{InstalledArtifact, Version};
use crate::error::KiraError;

pub const DEFAULT_POINTER: &str = "default";
pub const MARKER_FILE: &str = ".kira-installed.json";

/// Outcome of moving a resource's `default` pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DefaultSwitch {
    Unchanged { version: String },
    Created { version: String },
    Switched { from: String, to: String },
    KeptNewer { current: String, requested: String },
}

/// Versioned on-disk layout:
/// `<root>/<category>/<resource>/<version>/` plus a `default` pointer per resource.
#[derive(Debug, Clone)]
pub struct InstallStore {
    root: Utf8PathBuf,
}

impl InstallStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn resource_dir(&self, category: &str, name: &str) -> Utf8PathBuf {
        self.root.join(category).join(name)
    }

    pub fn version_dir(&self, category: &str, name: &str, version: &Version) -> Utf8PathBuf {
        self.resource_dir(category, name).join(version.as_str())
    }

    pub fn default_pointer(&self, category: &str, name: &str) -> Utf8PathBuf {
        self.resource_dir(category, name).join(DEFAULT_POINTER)
    }

    pub fn marker_path(&self, category: &str, name: &str, version: &Version) -> Utf8PathBuf {
        self.version_dir(category, name, version).join(MARKER_FILE)
    }

    /// Versions with a populated directory, ascending.
    pub fn installed_versions(&self, category: &str, name: &str) -> Result<Vec<Version>, KiraError> {
        let dir = self.resource_dir(category, name);
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if file_name == DEFAULT_POINTER || file_name.starts_with('.') || path.is_symlink() {
                continue;
            }
            if !path.is_dir() || !is_populated(&path) {
                continue;
            }
            if let Ok(version) = file_name.parse::<Version>() {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn is_installed(&self, category: &str, name: &str, version: &Version) -> bool {
        let dir = self.version_dir(category, name, version);
        dir.join(MARKER_FILE).as_std_path().exists() || is_populated(dir.as_std_path())
    }

    pub fn read_marker(
        &self,
        category: &str,
        name: &str,
        version: &Version,
    ) -> Result<Option<InstalledArtifact>, KiraError> {
        let path = self.marker_path(category, name, version);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let artifact = serde_json::from_str(&content)
            .map_err(|err| KiraError::Filesystem(format!("corrupt marker {path}: {err}")))?;
        Ok(Some(artifact))
    }

    pub fn write_marker(&self, artifact: &InstalledArtifact) -> Result<(), KiraError> {
        let path = artifact.install_path.join(MARKER_FILE);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(artifact)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Version the `default` pointer currently resolves to, if any.
    pub fn current_default(&self, category: &str, name: &str) -> Result<Option<Version>, KiraError> {
        let pointer = self.default_pointer(category, name);
        let Some(target) = read_pointer(pointer.as_std_path())? else {
            return Ok(None);
        };
        let Ok(version) = target.parse::<Version>() else {
            return Ok(None);
        };
        let dir = self.resource_dir(category, name).join(&target);
        if !dir.as_std_path().is_dir() {
            return Ok(None);
        }
        Ok(Some(version))
    }

    /// Points `default` at `version`. A strictly older version never displaces
    /// a newer default unless `force` is set; re-pointing to the current
    /// default is a no-op.
    pub fn set_default(
        &self,
        category: &str,
        name: &str,
        version: &Version,
        force: bool,
    ) -> Result<DefaultSwitch, KiraError> {
        let dir = self.version_dir(category, name, version);
        if !dir.as_std_path().is_dir() {
            return Err(KiraError::Filesystem(format!(
                "cannot set default for {name}: {dir} is not installed"
            )));
        }
        let pointer = self.default_pointer(category, name);
        let current_target = read_pointer(pointer.as_std_path())?;
        let current = self.current_default(category, name)?;

        if current_target.as_deref() == Some(version.as_str()) {
            return Ok(DefaultSwitch::Unchanged {
                version: version.to_string(),
            });
        }
        if let Some(current) = &current {
            if current > version && !force {
                tracing::info!(
                    resource = name,
                    current = %current,
                    requested = %version,
                    "keeping newer default"
                );
                return Ok(DefaultSwitch::KeptNewer {
                    current: current.to_string(),
                    requested: version.to_string(),
                });
            }
        }

        swap_pointer(pointer.as_std_path(), version.as_str())?;
        tracing::info!(resource = name, version = %version, "default switched");
        Ok(match current {
            Some(previous) => DefaultSwitch::Switched {
                from: previous.to_string(),
                to: version.to_string(),
            },
            None => DefaultSwitch::Created {
                version: version.to_string(),
            },
        })
    }

    /// Removes installed versions older than `below`, never touching the one
    /// `default` resolves to.
    pub fn remove_older_than(
        &self,
        category: &str,
        name: &str,
        below: &Version,
    ) -> Result<Vec<Version>, KiraError> {
        let current = self.current_default(category, name)?;
        let mut removed = Vec::new();
        for version in self.installed_versions(category, name)? {
            if &version >= below || current.as_ref() == Some(&version) {
                continue;
            }
            let dir = self.version_dir(category, name, &version);
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            tracing::info!(resource = name, version = %version, "removed stale version");
            removed.push(version);
        }
        Ok(removed)
    }

    /// Scratch directory next to the final version directory, so the final
    /// move is a same-filesystem rename.
    pub fn staging_dir(&self, category: &str, name: &str) -> Result<TempDir, KiraError> {
        let dir = self.resource_dir(category, name);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn commit_version(
        &self,
        staged: &Path,
        category: &str,
        name: &str,
        version: &Version,
    ) -> Result<Utf8PathBuf, KiraError> {
        let dir = self.version_dir(category, name, version);
        replace_dir(staged, dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(dir)
    }

    pub fn list_artifacts(&self) -> Result<Vec<InstalledArtifact>, KiraError> {
        let mut artifacts = Vec::new();
        if !self.root.as_std_path().exists() {
            return Ok(artifacts);
        }
        for category in sorted_subdirs(self.root.as_std_path())? {
            for resource in sorted_subdirs(&self.root.as_std_path().join(&category))? {
                let default = self.current_default(&category, &resource)?;
                for version in self.installed_versions(&category, &resource)? {
                    let is_default = default.as_ref() == Some(&version);
                    let mut artifact = match self.read_marker(&category, &resource, &version)? {
                        Some(marker) => marker,
                        None => InstalledArtifact {
                            resource_name: resource.clone(),
                            category: category.clone(),
                            version: version.clone(),
                            install_path: self.version_dir(&category, &resource, &version),
                            is_default,
                            installed_at: None,
                            source: None,
                        },
                    };
                    artifact.is_default = is_default;
                    artifacts.push(artifact);
                }
            }
        }
        Ok(artifacts)
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<String>, KiraError> {
    let mut names = fs::read_dir(dir)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir() && !entry.path().is_symlink())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.'))
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn is_populated(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(unix)]
fn read_pointer(pointer: &Path) -> Result<Option<String>, KiraError> {
    match fs::read_link(pointer) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) if err.kind() == io::ErrorKind::InvalidInput => Err(KiraError::Filesystem(
            format!("{} exists but is not a symlink", pointer.display()),
        )),
        Err(err) => Err(KiraError::Filesystem(err.to_string())),
    }
}

#[cfg(not(unix))]
fn read_pointer(pointer: &Path) -> Result<Option<String>, KiraError> {
    match fs::read_to_string(pointer) {
        Ok(content) => Ok(Some(content.trim().to_string()).filter(|value| !value.is_empty())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(KiraError::Filesystem(err.to_string())),
    }
}

/// Builds the new pointer under a temporary name and renames it over the old
/// one, so readers see either the old or the new target.
fn swap_pointer(pointer: &Path, target: &str) -> Result<(), KiraError> {
    let parent = pointer
        .parent()
        .ok_or_else(|| KiraError::Filesystem("pointer has no parent".to_string()))?;
    let tmp = parent.join(format!(
        ".{DEFAULT_POINTER}.tmp-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    if tmp.symlink_metadata().is_ok() {
        fs::remove_file(&tmp).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    write_pointer(&tmp, target)?;
    if let Err(err) = fs::rename(&tmp, pointer) {
        let _ = fs::remove_file(&tmp);
        return Err(KiraError::Filesystem(format!(
            "replace {}: {err}",
            pointer.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn write_pointer(path: &Path, target: &str) -> Result<(), KiraError> {
    std::os::unix::fs::symlink(target, path).map_err(|err| KiraError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
fn write_pointer(path: &Path, target: &str) -> Result<(), KiraError> {
    fs::write(path, target).map_err(|err| KiraError::Filesystem(err.to_string()))
}

/// Moves `from` to `to`. An existing `to` is renamed aside first and only
/// deleted once the new directory is in place; if that rename fails the old
/// directory is put back.
fn replace_dir(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if !to.exists() {
        return fs::rename(from, to);
    }
    let name = to
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::other(format!("no directory name in {}", to.display())))?;
    let aside = to.with_file_name(format!(".{name}.old-{}", std::process::id()));
    fs::rename(to, &aside)?;
    if let Err(err) = fs::rename(from, to) {
        fs::rename(&aside, to)?;
        return Err(err);
    }
    if let Err(err) = fs::remove_dir_all(&aside) {
        tracing::warn!(path = %aside.display(), error = %err, "could not remove replaced version");
    }
    Ok(())
}
