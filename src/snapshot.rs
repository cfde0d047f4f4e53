use std::fs::{self, File};
use std::path::Path;

use camino::Utf8Path;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::config::SnapshotSources;
use crate::domain::{AcquisitionAttempt, FetchHook, Resource, StrategyKind, Version};
use crate::error::KiraError;
use crate::fetch::{HttpFetcher, object_store_url};
use crate::fs_util;
use crate::store::{InstallStore, MARKER_FILE};
use crate::template;

/// Publishes a packed snapshot somewhere reachable by later installs.
pub trait Uploader: Send + Sync {
    fn upload(&self, url: &str, source: &Path) -> Result<(), KiraError>;
}

impl Uploader for HttpFetcher {
    fn upload(&self, url: &str, source: &Path) -> Result<(), KiraError> {
        let url = object_store_url(url)?;
        HttpFetcher::upload(self, &url, source)
    }
}

/// Relative location of a snapshot under a base URL.
pub const SNAPSHOT_PATH: &str = "{category}/{name}-{version}.tar.gz";

pub fn snapshot_url(base: &str, resource: &Resource, version: &Version) -> String {
    format!(
        "{}/{}/{}-{}.tar.gz",
        base.trim_end_matches('/'),
        resource.category,
        resource.name,
        version
    )
}

/// Same resource, acquired from the snapshot store instead of its upstream.
pub fn snapshot_resource(
    resource: &Resource,
    sources: &SnapshotSources,
) -> Result<Resource, KiraError> {
    let url = format!("{}/{SNAPSHOT_PATH}", sources.base_url.trim_end_matches('/'));
    template::validate(&url)?;
    let strategy = StrategyKind::from_url(&url)
        .ok_or_else(|| KiraError::InvalidCatalog(format!("cannot infer strategy for {url}")))?;
    let mut attempt = AcquisitionAttempt::new(strategy, url, resource.mandatory);
    attempt.post_fetch = vec![FetchHook::Unpack];

    let mut snapshot = resource.clone();
    snapshot.attempts = vec![attempt];
    // The packed tree already went through these.
    snapshot.post_install.clear();
    Ok(snapshot)
}

/// Packs `version_dir` into a gzipped tarball with a single `<prefix>/` root.
/// The install marker is left out.
pub fn pack(version_dir: &Path, prefix: &str, dest: &Path) -> Result<u64, KiraError> {
    let file = File::create(dest).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir(prefix, version_dir)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for path in fs_util::walk_dir(version_dir)? {
        let relative = path
            .strip_prefix(version_dir)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if relative == Path::new(MARKER_FILE) {
            continue;
        }
        let name = Path::new(prefix).join(relative);
        if path.is_dir() && !path.is_symlink() {
            builder
                .append_dir(&name, &path)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        } else {
            builder
                .append_path_with_name(&path, &name)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let size = fs::metadata(dest)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?
        .len();
    Ok(size)
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotUpload {
    pub resource: String,
    pub version: String,
    pub url: String,
    pub bytes: u64,
}

pub struct SnapshotPublisher<'a> {
    store: &'a InstallStore,
    uploader: &'a dyn Uploader,
    work_root: &'a Utf8Path,
}

impl<'a> SnapshotPublisher<'a> {
    pub fn new(store: &'a InstallStore, uploader: &'a dyn Uploader, work_root: &'a Utf8Path) -> Self {
        Self {
            store,
            uploader,
            work_root,
        }
    }

    /// Packs the requested version (or the current default) and uploads it.
    pub fn publish(
        &self,
        resource: &Resource,
        requested: Option<&Version>,
        sources: &SnapshotSources,
    ) -> Result<SnapshotUpload, KiraError> {
        let name = resource.name.as_str();
        let upload_base = sources.upload_url.as_deref().ok_or_else(|| {
            KiraError::InvalidCatalog("snapshots.upload_url is not configured".to_string())
        })?;
        let version = match requested {
            Some(version) => version.clone(),
            None => self
                .store
                .current_default(&resource.category, name)?
                .ok_or_else(|| KiraError::NotInstalled(name.to_string()))?,
        };
        if !self.store.is_installed(&resource.category, name, &version) {
            return Err(KiraError::NotInstalled(format!("{name} {version}")));
        }

        fs::create_dir_all(self.work_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let workdir = tempfile::Builder::new()
            .prefix("kira-snapshot-")
            .tempdir_in(self.work_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let archive = workdir.path().join(format!("{name}-{version}.tar.gz"));
        let version_dir = self.store.version_dir(&resource.category, name, &version);
        let bytes = pack(
            version_dir.as_std_path(),
            &format!("{name}-{version}"),
            &archive,
        )?;

        let url = snapshot_url(upload_base, resource, &version);
        tracing::info!(resource = name, version = %version, url = %url, bytes, "uploading snapshot");
        self.uploader.upload(&url, &archive)?;
        Ok(SnapshotUpload {
            resource: name.to_string(),
            version: version.to_string(),
            url,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use camino::Utf8PathBuf;

    use super::*;

    struct RecordingUploader {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Uploader for RecordingUploader {
        fn upload(&self, url: &str, source: &Path) -> Result<(), KiraError> {
            let bytes = fs::read(source).unwrap();
            self.uploads.lock().unwrap().push((url.to_string(), bytes));
            Ok(())
        }
    }

    fn resource() -> Resource {
        Resource {
            name: "samtools".parse().unwrap(),
            category: "bio_nextgen".to_string(),
            versions: vec!["1.17".parse().unwrap()],
            attempts: vec![AcquisitionAttempt::new(
                StrategyKind::Http,
                "https://github.com/samtools/samtools/releases/{version}.tar.bz2",
                true,
            )],
            probe: None,
            post_install: Vec::new(),
            mandatory: true,
        }
    }

    #[test]
    fn snapshot_resource_swaps_attempts() {
        let sources = SnapshotSources {
            base_url: "s3://biodata/snapshots/".to_string(),
            upload_url: None,
        };
        let snapshot = snapshot_resource(&resource(), &sources).unwrap();
        assert_eq!(snapshot.attempts.len(), 1);
        assert_eq!(snapshot.attempts[0].strategy, StrategyKind::ObjectStore);
        assert_eq!(
            snapshot.attempts[0].url,
            "s3://biodata/snapshots/{category}/{name}-{version}.tar.gz"
        );
        assert!(snapshot.attempts[0].mandatory);
    }

    #[test]
    fn publish_packs_default_version_without_marker() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = InstallStore::new(root.join("tools"));
        let version: Version = "1.17".parse().unwrap();
        let dir = store.version_dir("bio_nextgen", "samtools", &version);
        fs::create_dir_all(dir.join("bin").as_std_path()).unwrap();
        fs::write(dir.join("bin/samtools").as_std_path(), b"binary").unwrap();
        fs::write(dir.join(MARKER_FILE).as_std_path(), b"{}").unwrap();
        store
            .set_default("bio_nextgen", "samtools", &version, false)
            .unwrap();

        let uploader = RecordingUploader {
            uploads: Mutex::new(Vec::new()),
        };
        let work = root.join("work");
        let publisher = SnapshotPublisher::new(&store, &uploader, &work);
        let sources = SnapshotSources {
            base_url: "https://snapshots.example.org".to_string(),
            upload_url: Some("https://upload.example.org/snap".to_string()),
        };
        let upload = publisher.publish(&resource(), None, &sources).unwrap();
        assert_eq!(
            upload.url,
            "https://upload.example.org/snap/bio_nextgen/samtools-1.17.tar.gz"
        );

        let uploads = uploader.uploads.lock().unwrap();
        let archive = temp.path().join("check.tar.gz");
        fs::write(&archive, &uploads[0].1).unwrap();
        let out = temp.path().join("out");
        fs_util::unpack(&archive, &out).unwrap();
        assert!(out.join("samtools-1.17/bin/samtools").exists());
        assert!(!out.join("samtools-1.17").join(MARKER_FILE).exists());
    }
}
