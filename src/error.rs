use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid version string: {0}")]
    InvalidVersion(String),

    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("version {version} is not available for {resource}")]
    UnknownVersion { resource: String, version: String },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("unknown index kind: {0}")]
    UnknownIndexKind(String),

    #[error("unknown genome: {0}")]
    UnknownGenome(String),

    #[error("invalid url template {template}: {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("missing config file kira-prov.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid catalog entry: {0}")]
    InvalidCatalog(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("unrecognized archive format: {0}")]
    FormatError(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("all acquisition attempts failed for {resource}: {last}")]
    Exhausted { resource: String, last: String },

    #[error("genome {genome} is only partially indexed, skipped: {skipped}")]
    PartialBundle { genome: String, skipped: String },

    #[error("invalid FASTA file {path}: {message}")]
    InvalidFasta { path: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("{url} returned status {status}: {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("command `{program}` failed with status {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{failed} of {total} resources failed, first failure: {first}")]
    BatchFailed {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl KiraError {
    /// Errors a fallback chain may swallow before moving to the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, KiraError::NotFound(_) | KiraError::Timeout(_))
    }
}
