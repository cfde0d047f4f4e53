use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Dotted-numeric version. Numeric components compare as integers, missing
/// components count as zero and any trailing non-numeric text compares
/// lexically after the numbers (`1.2` == `1.2.0` < `1.2.0a` < `1.10`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    raw: String,
    parts: Vec<u64>,
    suffix: String,
}

impl Version {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    fn significant_parts(&self) -> &[u64] {
        let end = self
            .parts
            .iter()
            .rposition(|part| *part != 0)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        &self.parts[..end]
    }
}

impl FromStr for Version {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim().trim_start_matches('v').to_string();
        if !is_path_safe(&raw) || raw == "default" {
            return Err(KiraError::InvalidVersion(value.to_string()));
        }

        let mut parts = Vec::new();
        let mut suffix = String::new();
        let mut components = raw.split('.');
        for component in components.by_ref() {
            let digits = component
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect::<String>();
            if digits.is_empty() {
                suffix.push_str(component);
                break;
            }
            let number = digits
                .parse::<u64>()
                .map_err(|_| KiraError::InvalidVersion(value.to_string()))?;
            parts.push(number);
            if digits.len() != component.len() {
                suffix.push_str(&component[digits.len()..]);
                break;
            }
        }
        for rest in components {
            suffix.push('.');
            suffix.push_str(rest);
        }

        Ok(Self { raw, parts, suffix })
    }
}

impl TryFrom<String> for Version {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.raw
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            let left = self.parts.get(idx).copied().unwrap_or(0);
            let right = other.parts.get(idx).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        self.suffix.cmp(&other.suffix)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_parts().hash(state);
        self.suffix.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceName {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if !is_path_safe(&normalized) || normalized == "default" {
            return Err(KiraError::InvalidResourceName(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for ResourceName {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceName> for String {
    fn from(value: ResourceName) -> Self {
        value.0
    }
}

/// Names that end up as a single path component on disk.
pub fn is_path_safe(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '+'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Http,
    Ftp,
    Rsync,
    ObjectStore,
    Vcs,
}

impl StrategyKind {
    /// Picks the retrieval strategy implied by a URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("git://") || lower.starts_with("git+") {
            return Some(StrategyKind::Vcs);
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            if lower.ends_with(".git") {
                return Some(StrategyKind::Vcs);
            }
            return Some(StrategyKind::Http);
        }
        if lower.starts_with("ftp://") {
            return Some(StrategyKind::Ftp);
        }
        if lower.starts_with("rsync://") {
            return Some(StrategyKind::Rsync);
        }
        if lower.starts_with("s3://") {
            return Some(StrategyKind::ObjectStore);
        }
        None
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StrategyKind::Http => "http",
            StrategyKind::Ftp => "ftp",
            StrategyKind::Rsync => "rsync",
            StrategyKind::ObjectStore => "object_store",
            StrategyKind::Vcs => "vcs",
        };
        write!(f, "{label}")
    }
}

/// Step applied to a freshly fetched artifact before it is staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FetchHook {
    Unpack,
    Keep,
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionAttempt {
    pub strategy: StrategyKind,
    pub url: String,
    pub mandatory: bool,
    pub post_fetch: Vec<FetchHook>,
}

impl AcquisitionAttempt {
    pub fn new(strategy: StrategyKind, url: impl Into<String>, mandatory: bool) -> Self {
        Self {
            strategy,
            url: url.into(),
            mandatory,
            post_fetch: vec![FetchHook::Unpack],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryProbe {
    pub name: String,
    #[serde(default)]
    pub version_args: Vec<String>,
    #[serde(default)]
    pub version_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PostInstallStep {
    Move {
        from: String,
        to: String,
    },
    Chmod {
        path: String,
        mode: String,
    },
    EnvFile {
        path: String,
        vars: BTreeMap<String, String>,
    },
    Symlink {
        target: String,
        link: String,
    },
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: ResourceName,
    pub category: String,
    pub versions: Vec<Version>,
    pub attempts: Vec<AcquisitionAttempt>,
    pub probe: Option<BinaryProbe>,
    pub post_install: Vec<PostInstallStep>,
    pub mandatory: bool,
}

impl Resource {
    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.iter().max()
    }

    /// Returns the catalog version matching `requested`, or the newest one.
    pub fn resolve_version(&self, requested: Option<&Version>) -> Result<Version, KiraError> {
        match requested {
            Some(version) => self
                .versions
                .iter()
                .find(|candidate| *candidate == version)
                .cloned()
                .ok_or_else(|| KiraError::UnknownVersion {
                    resource: self.name.to_string(),
                    version: version.to_string(),
                }),
            None => self
                .latest_version()
                .cloned()
                .ok_or_else(|| KiraError::InvalidCatalog(format!("{} has no versions", self.name))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub resource_name: String,
    pub category: String,
    pub version: Version,
    pub install_path: Utf8PathBuf,
    pub is_default: bool,
    #[serde(default)]
    pub installed_at: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    Build,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenomeSource {
    /// Archive of per-chromosome FASTA files.
    Mirror { urls: Vec<String> },
    /// Gzipped multi-record FASTA published per release.
    Release { urls: Vec<String> },
    /// Single accession fetched from a REST endpoint.
    Accession {
        accession: String,
        #[serde(default)]
        urls: Vec<String>,
    },
    /// Hard-masked copy of an installed genome of the same organism.
    Masked { base: String },
}

impl GenomeSource {
    pub fn label(&self) -> &'static str {
        match self {
            GenomeSource::Mirror { .. } => "mirror",
            GenomeSource::Release { .. } => "release",
            GenomeSource::Accession { .. } => "accession",
            GenomeSource::Masked { .. } => "masked",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenomeFlags {
    #[serde(default)]
    pub dbsnp: bool,
    #[serde(default)]
    pub rnaseq: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomeRecord {
    pub organism: String,
    pub genome_id: String,
    pub source: GenomeSource,
    pub indexes: Vec<IndexKind>,
    pub flags: GenomeFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Seq,
    Dict,
    Bwa,
    Bowtie,
    Bowtie2,
    Hisat2,
    Star,
    Mosaik,
    Ucsc,
    Rtg,
}

impl IndexKind {
    pub const ALL: [IndexKind; 10] = [
        IndexKind::Seq,
        IndexKind::Dict,
        IndexKind::Bwa,
        IndexKind::Bowtie,
        IndexKind::Bowtie2,
        IndexKind::Hisat2,
        IndexKind::Star,
        IndexKind::Mosaik,
        IndexKind::Ucsc,
        IndexKind::Rtg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Seq => "seq",
            IndexKind::Dict => "dict",
            IndexKind::Bwa => "bwa",
            IndexKind::Bowtie => "bowtie",
            IndexKind::Bowtie2 => "bowtie2",
            IndexKind::Hisat2 => "hisat2",
            IndexKind::Star => "star",
            IndexKind::Mosaik => "mosaik",
            IndexKind::Ucsc => "ucsc",
            IndexKind::Rtg => "rtg",
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        IndexKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| KiraError::UnknownIndexKind(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexStatus {
    Pending,
    Built { path: String },
    Present { path: String },
    Skipped { reason: String },
    Failed { message: String },
}

impl IndexStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, IndexStatus::Built { .. } | IndexStatus::Present { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexJob {
    pub genome_id: String,
    pub kind: IndexKind,
    pub reference: Utf8PathBuf,
    pub status: IndexStatus,
}
