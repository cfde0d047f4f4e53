pub mod bundles;
pub mod fasta;
pub mod karyotype;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::command::Executor;
use crate::config::{BundleSources, ProvisionConfig};
use crate::domain::{
    AcquisitionAttempt, FetchHook, GenomeRecord, GenomeSource, IndexJob, StrategyKind,
};
use crate::error::KiraError;
use crate::fallback::FallbackEngine;
use crate::fetch::Retriever;
use crate::fs_util;
use crate::indexer::{IndexContext, IndexerRegistry};
use crate::template::TemplateVars;

use self::bundles::{BundleKind, BundleRoute};

pub const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi?db=nucleotide&id={accession}&rettype=fasta&retmode=text";

/// Masked genomes may be derived from masked genomes, but not endlessly.
const MAX_DERIVATION_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenomeState {
    NotDownloaded,
    Downloading,
    RawFetched,
    Normalized,
    Indexed,
}

/// `<data_root>/genomes/<organism>/<genome_id>/{seq,<index kind>,rnaseq,variation}`
#[derive(Debug, Clone)]
pub struct GenomeLayout {
    root: Utf8PathBuf,
}

impl GenomeLayout {
    pub fn new(data_root: &Utf8Path) -> Self {
        Self {
            root: data_root.join("genomes"),
        }
    }

    pub fn genome_dir(&self, organism: &str, genome_id: &str) -> Utf8PathBuf {
        self.root.join(organism).join(genome_id)
    }

    pub fn seq_dir(&self, organism: &str, genome_id: &str) -> Utf8PathBuf {
        self.genome_dir(organism, genome_id).join("seq")
    }

    pub fn fasta_path(&self, organism: &str, genome_id: &str) -> Utf8PathBuf {
        self.seq_dir(organism, genome_id)
            .join(format!("{genome_id}.fa"))
    }

    pub fn bundle_dir(&self, organism: &str, genome_id: &str, kind: BundleKind) -> Utf8PathBuf {
        self.genome_dir(organism, genome_id).join(kind.dir_name())
    }
}

/// Ordered acquisition attempts for a downloadable genome source. The last
/// attempt is mandatory; masked sources have none.
pub fn source_attempts(source: &GenomeSource) -> Result<Vec<AcquisitionAttempt>, KiraError> {
    let urls = match source {
        GenomeSource::Mirror { urls } | GenomeSource::Release { urls } => urls.clone(),
        GenomeSource::Accession { urls, .. } if !urls.is_empty() => urls.clone(),
        GenomeSource::Accession { .. } => vec![EFETCH_URL.to_string()],
        GenomeSource::Masked { .. } => return Ok(Vec::new()),
    };
    let count = urls.len();
    urls.into_iter()
        .enumerate()
        .map(|(idx, url)| {
            let strategy = StrategyKind::from_url(&url).ok_or_else(|| {
                KiraError::InvalidCatalog(format!("cannot infer strategy for {url}"))
            })?;
            let mut attempt = AcquisitionAttempt::new(strategy, url, idx + 1 == count);
            attempt.post_fetch = vec![FetchHook::Keep];
            Ok(attempt)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BundleStatus {
    Present,
    Fetched { url: String },
    Unavailable,
    Unconfigured,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleReport {
    pub kind: BundleKind,
    pub route: BundleRoute,
    pub status: BundleStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenomeReport {
    pub organism: String,
    pub genome_id: String,
    pub source: String,
    pub state: GenomeState,
    pub reference: String,
    pub fetched_from: Option<String>,
    pub bundles: Vec<BundleReport>,
    pub indexes: Vec<IndexJob>,
    pub partial: Option<String>,
    pub planned: Vec<String>,
}

pub struct GenomePipeline<'a> {
    config: &'a ProvisionConfig,
    retriever: &'a dyn Retriever,
    executor: &'a dyn Executor,
    bundles: &'a BundleSources,
    layout: GenomeLayout,
}

impl<'a> GenomePipeline<'a> {
    pub fn new(
        config: &'a ProvisionConfig,
        retriever: &'a dyn Retriever,
        executor: &'a dyn Executor,
        bundles: &'a BundleSources,
    ) -> Self {
        Self {
            config,
            retriever,
            executor,
            bundles,
            layout: GenomeLayout::new(&config.data_root),
        }
    }

    pub fn layout(&self) -> &GenomeLayout {
        &self.layout
    }

    fn engine(&self) -> FallbackEngine<'_> {
        FallbackEngine::new(
            self.retriever,
            self.executor,
            &self.config.work_root,
            &self.config.host,
        )
    }

    fn vars(genome: &GenomeRecord) -> TemplateVars {
        let mut vars = TemplateVars::host_defaults()
            .with("organism", genome.organism.as_str())
            .with("genome", genome.genome_id.as_str())
            .with("name", genome.genome_id.as_str());
        if let GenomeSource::Accession { accession, .. } = &genome.source {
            vars.set("accession", accession.as_str());
        }
        vars
    }

    /// Takes one genome from wherever it is to indexed. `catalog` resolves the
    /// base genome of masked sources.
    pub fn prepare(
        &self,
        genome: &GenomeRecord,
        catalog: &[GenomeRecord],
    ) -> Result<GenomeReport, KiraError> {
        let fasta = self.layout.fasta_path(&genome.organism, &genome.genome_id);
        let mut report = GenomeReport {
            organism: genome.organism.clone(),
            genome_id: genome.genome_id.clone(),
            source: genome.source.label().to_string(),
            state: GenomeState::NotDownloaded,
            reference: fasta.to_string(),
            fetched_from: None,
            bundles: Vec::new(),
            indexes: Vec::new(),
            partial: None,
            planned: Vec::new(),
        };

        if self.config.dry_run {
            report.planned = self.plan(genome)?;
            return Ok(report);
        }

        report.fetched_from = self.ensure_reference(genome, catalog, 0)?;
        report.state = GenomeState::Normalized;

        for kind in [BundleKind::Dbsnp, BundleKind::Rnaseq] {
            let wanted = match kind {
                BundleKind::Dbsnp => genome.flags.dbsnp,
                BundleKind::Rnaseq => genome.flags.rnaseq,
            };
            if wanted {
                report.bundles.push(self.fetch_bundle(genome, kind));
            }
        }

        let genome_dir = self.layout.genome_dir(&genome.organism, &genome.genome_id);
        let ctx = IndexContext {
            genome_id: &genome.genome_id,
            genome_dir: &genome_dir,
            fasta: &fasta,
            threads: self.config.threads.max(1),
        };
        let registry = IndexerRegistry::new(self.executor, &self.config.host);
        report.indexes = registry.build_all(&ctx, &genome.indexes);

        let incomplete = incomplete_kinds(&report.indexes);
        if !incomplete.is_empty() {
            let partial = KiraError::PartialBundle {
                genome: genome.genome_id.clone(),
                skipped: incomplete.join(", "),
            };
            tracing::warn!(genome = %genome.genome_id, "{partial}");
            report.partial = Some(partial.to_string());
        }
        report.state = GenomeState::Indexed;
        enter(&genome.genome_id, report.state);
        Ok(report)
    }

    fn plan(&self, genome: &GenomeRecord) -> Result<Vec<String>, KiraError> {
        let vars = Self::vars(genome);
        let mut planned = match &genome.source {
            GenomeSource::Masked { base } => vec![format!("mask {base}")],
            source => self
                .engine()
                .plan(&source_attempts(source)?, &vars)?
                .into_iter()
                .map(|plan| format!("{} {}", plan.strategy, plan.url))
                .collect(),
        };
        for kind in [BundleKind::Dbsnp, BundleKind::Rnaseq] {
            let wanted = match kind {
                BundleKind::Dbsnp => genome.flags.dbsnp,
                BundleKind::Rnaseq => genome.flags.rnaseq,
            };
            if !wanted {
                continue;
            }
            let vars = vars.clone().with("bundle", kind.as_str());
            let attempts = bundles::attempts(&bundles::route(self.bundles, &genome.organism))?;
            for plan in self.engine().plan(&attempts, &vars)? {
                planned.push(format!("{kind} {} {}", plan.strategy, plan.url));
            }
        }
        planned.extend(genome.indexes.iter().map(|kind| format!("index {kind}")));
        Ok(planned)
    }

    /// Leaves a validated `seq/<genome_id>.fa` on disk. Returns the URL it
    /// came from when a download happened.
    fn ensure_reference(
        &self,
        genome: &GenomeRecord,
        catalog: &[GenomeRecord],
        depth: usize,
    ) -> Result<Option<String>, KiraError> {
        let fasta = self.layout.fasta_path(&genome.organism, &genome.genome_id);
        if fasta.as_std_path().exists() {
            match fasta::validate(fasta.as_std_path()) {
                Ok(_) => {
                    tracing::debug!(genome = %genome.genome_id, "reference present");
                    return Ok(None);
                }
                Err(err) => {
                    tracing::warn!(genome = %genome.genome_id, error = %err, "discarding invalid reference");
                    fs::remove_file(fasta.as_std_path())
                        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
                }
            }
        }

        let fetched_from = match &genome.source {
            GenomeSource::Masked { base } => {
                if depth >= MAX_DERIVATION_DEPTH {
                    return Err(KiraError::InvalidCatalog(format!(
                        "masked genome chain too deep at {}",
                        genome.genome_id
                    )));
                }
                let base_record = catalog
                    .iter()
                    .find(|other| &other.genome_id == base && other.organism == genome.organism)
                    .ok_or_else(|| KiraError::UnknownGenome(base.clone()))?;
                self.ensure_reference(base_record, catalog, depth + 1)?;
                let base_fasta = self.layout.fasta_path(&base_record.organism, base);
                tracing::info!(genome = %genome.genome_id, base = %base, "hard-masking reference");
                fasta::hard_mask(base_fasta.as_std_path(), fasta.as_std_path())?;
                None
            }
            source => {
                enter(&genome.genome_id, GenomeState::Downloading);
                let attempts = source_attempts(source)?;
                let acquired = self.engine().acquire_with(
                    &genome.genome_id,
                    &attempts,
                    &Self::vars(genome),
                    |acquired| {
                        enter(&genome.genome_id, GenomeState::RawFetched);
                        normalize(&acquired.path, acquired.workdir, fasta.as_std_path())?;
                        Ok(acquired.url.clone())
                    },
                )?;
                let Some(url) = acquired else {
                    return Err(KiraError::Exhausted {
                        resource: genome.genome_id.clone(),
                        last: "no source produced a reference".to_string(),
                    });
                };
                Some(url)
            }
        };

        let records = fasta::validate(fasta.as_std_path())?;
        remove_leftovers(self.layout.seq_dir(&genome.organism, &genome.genome_id).as_std_path())?;
        tracing::info!(genome = %genome.genome_id, records, "reference ready");
        enter(&genome.genome_id, GenomeState::Normalized);
        Ok(fetched_from)
    }

    fn fetch_bundle(&self, genome: &GenomeRecord, kind: BundleKind) -> BundleReport {
        let route = bundles::route(self.bundles, &genome.organism);
        let target = self.layout.bundle_dir(&genome.organism, &genome.genome_id, kind);
        let status = match self.try_fetch_bundle(genome, kind, &route, &target) {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(genome = %genome.genome_id, bundle = %kind, error = %err, "bundle failed");
                BundleStatus::Failed {
                    message: err.to_string(),
                }
            }
        };
        BundleReport {
            kind,
            route,
            status,
        }
    }

    fn try_fetch_bundle(
        &self,
        genome: &GenomeRecord,
        kind: BundleKind,
        route: &BundleRoute,
        target: &Utf8Path,
    ) -> Result<BundleStatus, KiraError> {
        if is_populated(target.as_std_path()) {
            return Ok(BundleStatus::Present);
        }
        let attempts = bundles::attempts(route)?;
        if attempts.is_empty() {
            return Ok(BundleStatus::Unconfigured);
        }
        let vars = Self::vars(genome).with("bundle", kind.as_str());
        let label = format!("{}-{kind}", genome.genome_id);
        let fetched = self
            .engine()
            .acquire_with(&label, &attempts, &vars, |acquired| {
                merge_into(&acquired.path, target.as_std_path())?;
                Ok(acquired.url.clone())
            })?;
        Ok(match fetched {
            Some(url) => BundleStatus::Fetched { url },
            None => BundleStatus::Unavailable,
        })
    }
}

fn enter(genome_id: &str, state: GenomeState) {
    tracing::info!(genome = genome_id, state = ?state, "genome state");
}

fn is_populated(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn is_archive_name(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    [".gz", ".tgz", ".zip", ".tar"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Unpacks archives found inside `root` in place until none are left.
fn expand_nested(root: &Path) -> Result<(), KiraError> {
    for _round in 0..3 {
        let archives = fs_util::walk_dir(root)?
            .into_iter()
            .filter(|path| path.is_file() && is_archive_name(path))
            .collect::<Vec<_>>();
        if archives.is_empty() {
            return Ok(());
        }
        for archive in archives {
            let parent = archive
                .parent()
                .ok_or_else(|| KiraError::Filesystem("archive has no parent".to_string()))?;
            fs_util::unpack(&archive, parent)?;
            fs::remove_file(&archive).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Raw download to canonical FASTA: unpack, split into records, sort by
/// karyotype, concatenate into `dest`.
fn normalize(raw: &Path, workdir: &Path, dest: &Path) -> Result<(), KiraError> {
    let root = if raw.is_dir() {
        raw.to_path_buf()
    } else {
        let target = workdir.join("raw");
        fs_util::unpack(raw, &target)?;
        fs::remove_file(raw).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        target
    };
    expand_nested(&root)?;

    let sources = fs_util::walk_dir(&root)?
        .into_iter()
        .filter(|path| path.is_file() && fasta::is_fasta(path))
        .collect::<Vec<_>>();
    if sources.is_empty() {
        return Err(KiraError::FormatError(format!(
            "no FASTA records in {}",
            raw.display()
        )));
    }

    let records_dir = workdir.join("records");
    let mut seen = HashSet::new();
    let mut records: Vec<(String, PathBuf)> = Vec::new();
    for source in &sources {
        records.extend(fasta::split_records(source, &records_dir, &mut seen)?);
    }
    karyotype::sort_names(&mut records, |(name, _)| name.as_str());
    let parts = records.into_iter().map(|(_, path)| path).collect::<Vec<_>>();
    fasta::concat(&parts, dest)
}

/// Moves a fetched file, or the contents of a fetched tree, into `target`.
fn merge_into(fetched: &Path, target: &Path) -> Result<(), KiraError> {
    fs::create_dir_all(target).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    if fetched.is_dir() {
        let entries = fs::read_dir(fetched).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            fs_util::move_path(&entry.path(), &target.join(entry.file_name()))?;
        }
        return Ok(());
    }
    let name = fetched
        .file_name()
        .ok_or_else(|| KiraError::Filesystem("bundle has no file name".to_string()))?;
    fs_util::move_path(fetched, &target.join(name))
}

/// Drops compressed intermediates left next to the canonical reference.
fn remove_leftovers(seq_dir: &Path) -> Result<(), KiraError> {
    let entries = fs::read_dir(seq_dir).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for entry in entries {
        let path = entry
            .map_err(|err| KiraError::Filesystem(err.to_string()))?
            .path();
        if path.is_file() && is_archive_name(&path) {
            fs::remove_file(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Names of requested kinds that did not end up usable.
pub fn incomplete_kinds(jobs: &[IndexJob]) -> Vec<String> {
    jobs.iter()
        .filter(|job| !job.status.is_usable())
        .map(|job| job.kind.to_string())
        .collect()
}
