use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::command::Executor;
use crate::config::{ProvisionConfig, ResolvedCatalog, SnapshotSources};
use crate::domain::{AcquisitionMode, GenomeRecord, GenomeSource, InstalledArtifact, Resource, Version};
use crate::error::KiraError;
use crate::fetch::Retriever;
use crate::genome::{GenomePipeline, GenomeReport};
use crate::installer::{BatchItem, InstallDispatcher, InstallOutcome, InstallRequest};
use crate::snapshot::{self, SnapshotPublisher, SnapshotUpload, Uploader};
use crate::store::InstallStore;

/// Which catalog entries a command applies to. Names may carry a pinned
/// version as `name@version`.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub names: Vec<String>,
    pub category: Option<String>,
}

impl Selection {
    fn split(&self) -> Result<(Vec<String>, Vec<(String, Option<Version>)>), KiraError> {
        let mut names = Vec::new();
        let mut pinned = Vec::new();
        for raw in &self.names {
            let (name, version) = match raw.split_once('@') {
                Some((name, version)) => (name.trim().to_string(), Some(version.parse::<Version>()?)),
                None => (raw.trim().to_string(), None),
            };
            names.push(name.clone());
            pinned.push((name, version));
        }
        Ok((names, pinned))
    }

    fn resolve<'c>(
        &self,
        catalog: &'c ResolvedCatalog,
    ) -> Result<Vec<(&'c Resource, Option<Version>)>, KiraError> {
        let (names, pinned) = self.split()?;
        let selected = catalog.select(&names, self.category.as_deref())?;
        Ok(selected
            .into_iter()
            .map(|resource| {
                let version = pinned
                    .iter()
                    .find(|(name, _)| name == resource.name.as_str())
                    .and_then(|(_, version)| version.clone());
                (resource, version)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub mode: String,
    pub items: Vec<BatchItem>,
    pub failed: usize,
    pub mandatory_failure: Option<String>,
}

impl InstallResult {
    /// Fails when a mandatory resource could not be installed.
    pub fn check(&self) -> Result<(), KiraError> {
        match &self.mandatory_failure {
            Some(first) => Err(KiraError::BatchFailed {
                failed: self.failed,
                total: self.items.len(),
                first: first.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadItem {
    pub resource: String,
    pub upload: Option<SnapshotUpload>,
    pub planned_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub items: Vec<UploadItem>,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenomeFailure {
    pub genome_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenomesResult {
    pub genomes: Vec<GenomeReport>,
    pub failures: Vec<GenomeFailure>,
}

impl GenomesResult {
    pub fn check(&self) -> Result<(), KiraError> {
        match self.failures.first() {
            Some(first) => Err(KiraError::BatchFailed {
                failed: self.failures.len(),
                total: self.genomes.len() + self.failures.len(),
                first: format!("{}: {}", first.genome_id, first.error),
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenomeListing {
    pub organism: String,
    pub genome_id: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub installed: Vec<InstalledArtifact>,
    pub genomes: Vec<GenomeListing>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<R: Retriever, E: Executor, U: Uploader> {
    config: ProvisionConfig,
    store: InstallStore,
    retriever: R,
    executor: E,
    uploader: U,
}

impl<R: Retriever, E: Executor, U: Uploader> App<R, E, U> {
    pub fn new(config: ProvisionConfig, retriever: R, executor: E, uploader: U) -> Self {
        let store = InstallStore::new(config.install_root.clone());
        Self {
            config,
            store,
            retriever,
            executor,
            uploader,
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn store(&self) -> &InstallStore {
        &self.store
    }

    fn dispatcher(&self) -> InstallDispatcher<'_> {
        InstallDispatcher::new(&self.config, &self.store, &self.retriever, &self.executor)
    }

    pub fn install(
        &self,
        catalog: &ResolvedCatalog,
        selection: &Selection,
        sink: &dyn ProgressSink,
    ) -> Result<InstallResult, KiraError> {
        if self.config.mode == AcquisitionMode::Snapshot {
            return self.install_from_snapshot(catalog, selection, sink);
        }
        let selected = selection.resolve(catalog)?;
        let requests = selected
            .into_iter()
            .map(|(resource, version)| InstallRequest { resource, version })
            .collect::<Vec<_>>();
        Ok(self.run_batch("build", &requests, sink))
    }

    pub fn install_from_snapshot(
        &self,
        catalog: &ResolvedCatalog,
        selection: &Selection,
        sink: &dyn ProgressSink,
    ) -> Result<InstallResult, KiraError> {
        let sources = catalog.snapshots.as_ref().ok_or_else(|| {
            KiraError::InvalidCatalog("no snapshots section in catalog".to_string())
        })?;
        let selected = selection.resolve(catalog)?;
        let mut snapshot_resources = Vec::with_capacity(selected.len());
        for (resource, version) in selected {
            snapshot_resources.push((snapshot::snapshot_resource(resource, sources)?, version));
        }
        let requests = snapshot_resources
            .iter()
            .map(|(resource, version)| InstallRequest {
                resource,
                version: version.clone(),
            })
            .collect::<Vec<_>>();
        Ok(self.run_batch("snapshot", &requests, sink))
    }

    fn run_batch(
        &self,
        mode: &str,
        requests: &[InstallRequest<'_>],
        sink: &dyn ProgressSink,
    ) -> InstallResult {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("Provisioning {} resource(s)", requests.len()),
            elapsed: None,
        });
        let mut last = Instant::now();
        let report = self.dispatcher().install_batch(requests, |item| {
            sink.event(ProgressEvent {
                message: describe_item(item),
                elapsed: Some(last.elapsed()),
            });
            last = Instant::now();
        });
        let failed = report.failed();
        let mandatory_failure = report.first_mandatory_failure().map(ToString::to_string);
        sink.event(ProgressEvent {
            message: format!("Done: {} ok, {failed} failed", report.items.len() - failed),
            elapsed: Some(started.elapsed()),
        });
        InstallResult {
            mode: mode.to_string(),
            items: report.items,
            failed,
            mandatory_failure,
        }
    }

    pub fn upload_snapshots(
        &self,
        catalog: &ResolvedCatalog,
        selection: &Selection,
        sink: &dyn ProgressSink,
    ) -> Result<UploadResult, KiraError> {
        let sources = catalog.snapshots.as_ref().ok_or_else(|| {
            KiraError::InvalidCatalog("no snapshots section in catalog".to_string())
        })?;
        let publisher = SnapshotPublisher::new(&self.store, &self.uploader, &self.config.work_root);
        let mut items = Vec::new();
        for (resource, version) in selection.resolve(catalog)? {
            let started = Instant::now();
            let name = resource.name.to_string();
            let mut item = UploadItem {
                resource: name.clone(),
                upload: None,
                planned_url: None,
                error: None,
            };
            if self.config.dry_run {
                item.planned_url = self.planned_upload(resource, version.as_ref(), sources)?;
            } else {
                match publisher.publish(resource, version.as_ref(), sources) {
                    Ok(upload) => item.upload = Some(upload),
                    Err(err) => {
                        tracing::error!(resource = %name, error = %err, "snapshot upload failed");
                        item.error = Some(err.to_string());
                    }
                }
            }
            sink.event(ProgressEvent {
                message: match (&item.upload, &item.error) {
                    (Some(upload), _) => format!("Uploaded {name} {} to {}", upload.version, upload.url),
                    (None, Some(error)) => format!("Upload of {name} failed: {error}"),
                    (None, None) => format!("Would upload {name}"),
                },
                elapsed: Some(started.elapsed()),
            });
            items.push(item);
        }
        let failed = items.iter().filter(|item| item.error.is_some()).count();
        Ok(UploadResult { items, failed })
    }

    fn planned_upload(
        &self,
        resource: &Resource,
        requested: Option<&Version>,
        sources: &SnapshotSources,
    ) -> Result<Option<String>, KiraError> {
        let Some(base) = sources.upload_url.as_deref() else {
            return Ok(None);
        };
        let version = match requested {
            Some(version) => Some(version.clone()),
            None => self
                .store
                .current_default(&resource.category, resource.name.as_str())?,
        };
        Ok(version.map(|version| snapshot::snapshot_url(base, resource, &version)))
    }

    /// Prepares the selected genomes, or all of them. Masked genomes run after
    /// the genomes they derive from.
    pub fn prepare_genomes(
        &self,
        catalog: &ResolvedCatalog,
        genome_ids: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<GenomesResult, KiraError> {
        let mut selected = if genome_ids.is_empty() {
            catalog.genomes.iter().collect::<Vec<_>>()
        } else {
            genome_ids
                .iter()
                .map(|id| catalog.genome(id))
                .collect::<Result<Vec<_>, KiraError>>()?
        };
        selected.sort_by_key(|genome| matches!(genome.source, GenomeSource::Masked { .. }));

        let pipeline = GenomePipeline::new(
            &self.config,
            &self.retriever,
            &self.executor,
            &catalog.bundles,
        );
        let mut genomes = Vec::new();
        let mut failures = Vec::new();
        for genome in selected {
            let started = Instant::now();
            sink.event(ProgressEvent {
                message: format!("Preparing {} ({})", genome.genome_id, genome.organism),
                elapsed: None,
            });
            match pipeline.prepare(genome, &catalog.genomes) {
                Ok(report) => {
                    sink.event(ProgressEvent {
                        message: describe_genome(genome, &report),
                        elapsed: Some(started.elapsed()),
                    });
                    genomes.push(report);
                }
                Err(err) => {
                    tracing::error!(genome = %genome.genome_id, error = %err, "genome failed");
                    sink.event(ProgressEvent {
                        message: format!("{} failed: {err}", genome.genome_id),
                        elapsed: Some(started.elapsed()),
                    });
                    failures.push(GenomeFailure {
                        genome_id: genome.genome_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(GenomesResult { genomes, failures })
    }

    pub fn list(&self, sink: &dyn ProgressSink) -> Result<ListResult, KiraError> {
        let started = Instant::now();
        let installed = self.store.list_artifacts()?;
        let genomes = list_genomes(&self.config.data_root.join("genomes"))?;
        sink.event(ProgressEvent {
            message: format!(
                "Found {} installed version(s), {} genome(s)",
                installed.len(),
                genomes.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(ListResult { installed, genomes })
    }
}

fn describe_item(item: &BatchItem) -> String {
    if let Some(error) = &item.error {
        return format!("{} failed: {error}", item.resource);
    }
    match &item.outcome {
        Some(InstallOutcome::Present { version, .. }) => {
            format!("{} {version} already installed", item.resource)
        }
        Some(InstallOutcome::Installed { version, source, .. }) => {
            format!("Installed {} {version} from {source}", item.resource)
        }
        Some(InstallOutcome::Unavailable { version }) => {
            format!("{} {version} unavailable, skipped", item.resource)
        }
        Some(InstallOutcome::Planned { version, attempts }) => format!(
            "Would install {} {version} via {} attempt(s)",
            item.resource,
            attempts.len()
        ),
        None => item.resource.clone(),
    }
}

fn describe_genome(genome: &GenomeRecord, report: &GenomeReport) -> String {
    if !report.planned.is_empty() {
        return format!("Would prepare {} in {} step(s)", genome.genome_id, report.planned.len());
    }
    match &report.partial {
        Some(partial) => partial.clone(),
        None => format!("{} ready with {} index(es)", genome.genome_id, report.indexes.len()),
    }
}

fn sorted_dirs(path: &Utf8Path) -> Result<Vec<String>, KiraError> {
    if !path.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let entries =
        fs::read_dir(path.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn list_genomes(root: &Utf8Path) -> Result<Vec<GenomeListing>, KiraError> {
    let mut genomes = Vec::new();
    for organism in sorted_dirs(root)? {
        for genome_id in sorted_dirs(&root.join(&organism))? {
            let components = sorted_dirs(&root.join(&organism).join(&genome_id))?;
            genomes.push(GenomeListing {
                organism: organism.clone(),
                genome_id,
                components,
            });
        }
    }
    Ok(genomes)
}
