use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AcquisitionAttempt, AcquisitionMode, BinaryProbe, FetchHook, GenomeFlags, GenomeRecord,
    GenomeSource, IndexKind, PostInstallStep, Resource, ResourceName, StrategyKind, Version,
    is_path_safe,
};
use crate::error::KiraError;
use crate::template;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Catalog {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    #[serde(default)]
    pub genomes: Vec<GenomeEntry>,
    #[serde(default)]
    pub bundles: Option<BundleEntry>,
    #[serde(default)]
    pub snapshots: Option<SnapshotEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResourceEntry {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub versions: Vec<String>,
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
    #[serde(default)]
    pub acquisition: Vec<AttemptEntry>,
    #[serde(default)]
    pub probe: Option<ProbeEntry>,
    #[serde(default)]
    pub post_install: Vec<PostInstallStep>,
    #[serde(default)]
    pub mandatory: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttemptEntry {
    Shorthand(String),
    Detailed(AttemptEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AttemptEntryObject {
    pub url: String,
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    #[serde(default)]
    pub mandatory: Option<bool>,
    #[serde(default)]
    pub post_fetch: Option<Vec<FetchHook>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProbeEntry {
    Shorthand(String),
    Detailed(BinaryProbe),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GenomeEntry {
    pub organism: String,
    pub id: String,
    pub source: GenomeSource,
    #[serde(default)]
    pub indexes: Option<Vec<String>>,
    #[serde(default)]
    pub dbsnp: bool,
    #[serde(default)]
    pub rnaseq: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BundleEntry {
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SnapshotEntry {
    pub base_url: String,
    #[serde(default)]
    pub upload_url: Option<String>,
}

/// Where auxiliary genome bundles (dbSNP, RNA-seq annotation) come from.
#[derive(Debug, Clone, Default)]
pub struct BundleSources {
    pub base: Option<String>,
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotSources {
    pub base_url: String,
    pub upload_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedCatalog {
    pub schema_version: u32,
    pub resources: Vec<Resource>,
    pub genomes: Vec<GenomeRecord>,
    pub bundles: BundleSources,
    pub snapshots: Option<SnapshotSources>,
}

impl ResolvedCatalog {
    pub fn resource(&self, name: &str) -> Result<&Resource, KiraError> {
        self.resources
            .iter()
            .find(|resource| resource.name.as_str() == name)
            .ok_or_else(|| KiraError::UnknownResource(name.to_string()))
    }

    pub fn genome(&self, genome_id: &str) -> Result<&GenomeRecord, KiraError> {
        self.genomes
            .iter()
            .find(|genome| genome.genome_id == genome_id)
            .ok_or_else(|| KiraError::UnknownGenome(genome_id.to_string()))
    }

    /// Resources selected by name and/or category, in catalog order.
    pub fn select(
        &self,
        names: &[String],
        category: Option<&str>,
    ) -> Result<Vec<&Resource>, KiraError> {
        for name in names {
            self.resource(name)?;
        }
        Ok(self
            .resources
            .iter()
            .filter(|resource| {
                names.is_empty() || names.iter().any(|n| n == resource.name.as_str())
            })
            .filter(|resource| category.is_none_or(|c| resource.category == c))
            .collect())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedCatalog, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("kira-prov.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let catalog: Catalog = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_catalog(catalog, std::env::consts::OS)
    }

    pub fn resolve_catalog(catalog: Catalog, target: &str) -> Result<ResolvedCatalog, KiraError> {
        let schema_version = catalog.schema_version.unwrap_or(1);

        let mut seen = HashSet::new();
        let resources = catalog
            .resources
            .into_iter()
            .map(|entry| {
                let resource = resolve_resource(entry, target)?;
                if !seen.insert(resource.name.clone()) {
                    return Err(KiraError::InvalidCatalog(format!(
                        "duplicate resource {}",
                        resource.name
                    )));
                }
                Ok(resource)
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let genomes = catalog
            .genomes
            .into_iter()
            .map(resolve_genome)
            .collect::<Result<Vec<_>, KiraError>>()?;
        validate_genomes(&genomes)?;

        let bundles = match catalog.bundles {
            Some(entry) => {
                if let Some(base) = &entry.base {
                    template::validate(base)?;
                }
                for url in entry.overrides.values() {
                    template::validate(url)?;
                }
                BundleSources {
                    base: entry.base,
                    overrides: entry.overrides,
                }
            }
            None => BundleSources::default(),
        };

        let snapshots = catalog.snapshots.map(|entry| SnapshotSources {
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            upload_url: entry
                .upload_url
                .map(|url| url.trim_end_matches('/').to_string()),
        });

        Ok(ResolvedCatalog {
            schema_version,
            resources,
            genomes,
            bundles,
            snapshots,
        })
    }
}

fn resolve_resource(entry: ResourceEntry, target: &str) -> Result<Resource, KiraError> {
    let name: ResourceName = entry.name.parse()?;
    if !is_path_safe(&entry.category) {
        return Err(KiraError::InvalidCatalog(format!(
            "invalid category {} for {name}",
            entry.category
        )));
    }

    let mut versions = entry
        .versions
        .iter()
        .map(|value| value.parse::<Version>())
        .collect::<Result<Vec<_>, KiraError>>()?;
    if versions.is_empty() {
        return Err(KiraError::InvalidCatalog(format!("{name} lists no versions")));
    }
    versions.sort();
    versions.dedup();

    let mandatory = entry.mandatory.unwrap_or(true);
    let attempts = if entry.acquisition.is_empty() {
        attempts_from_sources(&entry.sources, target, mandatory)?
    } else {
        let count = entry.acquisition.len();
        entry
            .acquisition
            .into_iter()
            .enumerate()
            .map(|(idx, attempt)| resolve_attempt(attempt, idx + 1 == count && mandatory))
            .collect::<Result<Vec<_>, KiraError>>()?
    };
    if attempts.is_empty() {
        return Err(KiraError::InvalidCatalog(format!(
            "{name} has no acquisition source for target {target}"
        )));
    }

    let probe = entry.probe.map(|probe| match probe {
        ProbeEntry::Shorthand(binary) => BinaryProbe {
            name: binary,
            version_args: Vec::new(),
            version_pattern: None,
        },
        ProbeEntry::Detailed(probe) => probe,
    });
    if let Some(pattern) = probe.as_ref().and_then(|p| p.version_pattern.as_deref()) {
        regex::Regex::new(pattern)
            .map_err(|err| KiraError::InvalidCatalog(format!("{name} probe pattern: {err}")))?;
    }

    Ok(Resource {
        name,
        category: entry.category,
        versions,
        attempts,
        probe,
        post_install: entry.post_install,
        mandatory,
    })
}

/// Target-specific source first, the portable `any` source last.
fn attempts_from_sources(
    sources: &BTreeMap<String, String>,
    target: &str,
    mandatory: bool,
) -> Result<Vec<AcquisitionAttempt>, KiraError> {
    let urls = [sources.get(target), sources.get("any")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    let count = urls.len();
    urls.into_iter()
        .enumerate()
        .map(|(idx, url)| {
            resolve_attempt(
                AttemptEntry::Shorthand(url.clone()),
                idx + 1 == count && mandatory,
            )
        })
        .collect()
}

fn resolve_attempt(
    entry: AttemptEntry,
    mandatory_default: bool,
) -> Result<AcquisitionAttempt, KiraError> {
    let (url, strategy, mandatory, post_fetch) = match entry {
        AttemptEntry::Shorthand(url) => (url, None, None, None),
        AttemptEntry::Detailed(obj) => (obj.url, obj.strategy, obj.mandatory, obj.post_fetch),
    };
    template::validate(&url)?;
    let strategy = strategy
        .or_else(|| StrategyKind::from_url(&url))
        .ok_or_else(|| KiraError::InvalidCatalog(format!("cannot infer strategy for {url}")))?;
    Ok(AcquisitionAttempt {
        strategy,
        url,
        mandatory: mandatory.unwrap_or(mandatory_default),
        post_fetch: post_fetch.unwrap_or_else(|| vec![FetchHook::Unpack]),
    })
}

fn resolve_genome(entry: GenomeEntry) -> Result<GenomeRecord, KiraError> {
    if !is_path_safe(&entry.organism) || !is_path_safe(&entry.id) {
        return Err(KiraError::InvalidCatalog(format!(
            "invalid genome {}/{}",
            entry.organism, entry.id
        )));
    }
    let indexes = match entry.indexes {
        Some(values) => values
            .iter()
            .map(|value| value.parse::<IndexKind>())
            .collect::<Result<Vec<_>, KiraError>>()?,
        None => default_genome_indexes(),
    };
    let mut indexes = indexes;
    // The reference itself is always prepared first.
    indexes.insert(0, IndexKind::Seq);
    let mut seen = HashSet::new();
    indexes.retain(|kind| seen.insert(*kind));

    match &entry.source {
        GenomeSource::Mirror { urls } | GenomeSource::Release { urls } => {
            if urls.is_empty() {
                return Err(KiraError::InvalidCatalog(format!(
                    "genome {} has no source urls",
                    entry.id
                )));
            }
            for url in urls {
                template::validate(url)?;
            }
        }
        GenomeSource::Accession { accession, urls } => {
            if accession.trim().is_empty() {
                return Err(KiraError::InvalidCatalog(format!(
                    "genome {} has an empty accession",
                    entry.id
                )));
            }
            for url in urls {
                template::validate(url)?;
            }
        }
        GenomeSource::Masked { base } => {
            if base == &entry.id {
                return Err(KiraError::InvalidCatalog(format!(
                    "genome {} cannot be masked from itself",
                    entry.id
                )));
            }
        }
    }

    Ok(GenomeRecord {
        organism: entry.organism,
        genome_id: entry.id,
        source: entry.source,
        indexes,
        flags: GenomeFlags {
            dbsnp: entry.dbsnp,
            rnaseq: entry.rnaseq,
        },
    })
}

fn validate_genomes(genomes: &[GenomeRecord]) -> Result<(), KiraError> {
    let mut ids = HashSet::new();
    for genome in genomes {
        if !ids.insert(genome.genome_id.as_str()) {
            return Err(KiraError::InvalidCatalog(format!(
                "duplicate genome {}",
                genome.genome_id
            )));
        }
    }
    for genome in genomes {
        if let GenomeSource::Masked { base } = &genome.source {
            let found = genomes
                .iter()
                .any(|other| &other.genome_id == base && other.organism == genome.organism);
            if !found {
                return Err(KiraError::InvalidCatalog(format!(
                    "masked genome {} references unknown base {base}",
                    genome.genome_id
                )));
            }
        }
    }
    Ok(())
}

pub fn default_category() -> String {
    "bio_nextgen".to_string()
}

pub fn default_genome_indexes() -> Vec<IndexKind> {
    vec![IndexKind::Seq, IndexKind::Bwa]
}

/// Static settings for one provisioning run. Built once and shared by reference.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub install_root: Utf8PathBuf,
    pub data_root: Utf8PathBuf,
    pub work_root: Utf8PathBuf,
    pub host: String,
    pub target: String,
    pub mode: AcquisitionMode,
    pub dry_run: bool,
    pub threads: usize,
}

impl ProvisionConfig {
    pub fn new() -> Result<Self, KiraError> {
        let base = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".kira-prov")).ok())
            .ok_or_else(|| {
                KiraError::Filesystem("unable to resolve home directory".to_string())
            })?;
        let work_root = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .map_err(|_| KiraError::Filesystem("non-utf8 temp directory".to_string()))?;

        Ok(Self {
            install_root: base.join("tools"),
            data_root: base.join("data"),
            work_root,
            host: "localhost".to_string(),
            target: std::env::consts::OS.to_string(),
            mode: AcquisitionMode::Build,
            dry_run: false,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        })
    }

    pub fn new_with_roots(
        install_root: Utf8PathBuf,
        data_root: Utf8PathBuf,
        work_root: Utf8PathBuf,
    ) -> Self {
        Self {
            install_root,
            data_root,
            work_root,
            host: "localhost".to_string(),
            target: std::env::consts::OS.to_string(),
            mode: AcquisitionMode::Build,
            dry_run: false,
            threads: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse(json: &str) -> Result<ResolvedCatalog, KiraError> {
        let catalog: Catalog = serde_json::from_str(json).unwrap();
        ConfigLoader::resolve_catalog(catalog, "linux")
    }

    #[test]
    fn sources_shorthand_orders_target_before_any() {
        let resolved = parse(
            r#"{
                "resources": [{
                    "name": "samtools",
                    "versions": ["1.9", "1.17"],
                    "sources": {
                        "any": "https://github.com/samtools/samtools/archive/{version}.tar.gz",
                        "linux": "s3://biodata/tools/samtools-{version}-linux.tar.gz"
                    }
                }]
            }"#,
        )
        .unwrap();
        let resource = &resolved.resources[0];
        assert_eq!(resource.category, "bio_nextgen");
        assert_eq!(resource.attempts.len(), 2);
        assert_eq!(resource.attempts[0].strategy, StrategyKind::ObjectStore);
        assert!(!resource.attempts[0].mandatory);
        assert_eq!(resource.attempts[1].strategy, StrategyKind::Http);
        assert!(resource.attempts[1].mandatory);
        assert_eq!(resource.latest_version().unwrap().as_str(), "1.17");
    }

    #[test]
    fn genome_indexes_always_start_with_seq() {
        let resolved = parse(
            r#"{
                "genomes": [{
                    "organism": "Scerevisiae",
                    "id": "sacCer3",
                    "source": {"kind": "mirror", "urls": ["rsync://hgdownload.soe.ucsc.edu/goldenPath/sacCer3/bigZips/chromFa.tar.gz"]},
                    "indexes": ["bwa", "seq", "bowtie2"]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(
            resolved.genomes[0].indexes,
            vec![IndexKind::Seq, IndexKind::Bwa, IndexKind::Bowtie2]
        );
    }

    #[test]
    fn masked_genome_requires_known_base() {
        let err = parse(
            r#"{
                "genomes": [{
                    "organism": "Hsapiens",
                    "id": "hg19-masked",
                    "source": {"kind": "masked", "base": "hg19"}
                }]
            }"#,
        )
        .unwrap_err();
        assert_matches!(err, KiraError::InvalidCatalog(_));
    }

    #[test]
    fn unknown_template_placeholder_is_rejected() {
        let err = parse(
            r#"{"resources": [{"name": "x", "versions": ["1"], "sources": {"any": "https://x/{release}"}}]}"#,
        )
        .unwrap_err();
        assert_matches!(err, KiraError::InvalidTemplate { .. });
    }
}
