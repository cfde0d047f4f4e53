#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;

use kira_provisioner::command::{CommandOutput, CommandSpec, Executor};
use kira_provisioner::config::ProvisionConfig;
use kira_provisioner::domain::StrategyKind;
use kira_provisioner::error::KiraError;
use kira_provisioner::fetch::Retriever;

/// Serves canned bytes per URL; anything else is `NotFound`.
#[derive(Default)]
pub struct MockRetriever {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, bytes: Vec<u8>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Retriever for MockRetriever {
    fn retrieve(
        &self,
        _strategy: StrategyKind,
        url: &str,
        destination: &Path,
    ) -> Result<PathBuf, KiraError> {
        self.calls.lock().unwrap().push(url.to_string());
        let responses = self.responses.lock().unwrap();
        let Some(bytes) = responses.get(url) else {
            return Err(KiraError::NotFound(url.to_string()));
        };
        std::fs::write(destination, bytes).unwrap();
        Ok(destination.to_path_buf())
    }
}

/// Pretends a fixed set of tools is installed and fakes their outputs.
pub struct MockExecutor {
    tools: Vec<&'static str>,
    version_output: Option<String>,
    pub calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn with_tools(tools: &[&'static str]) -> Self {
        Self {
            tools: tools.to_vec(),
            version_output: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reporting(mut self, output: &str) -> Self {
        self.version_output = Some(output.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|idx| args.get(idx + 1))
        .map(String::as_str)
}

impl Executor for MockExecutor {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, KiraError> {
        self.calls.lock().unwrap().push(command.to_string());
        let args = command.args();
        let mut stdout = String::new();
        match command.program() {
            "bwa" => {
                let prefix = arg_after(args, "-p").unwrap();
                std::fs::write(format!("{prefix}.bwt"), b"bwt").unwrap();
            }
            "samtools" if args.first().map(String::as_str) == Some("dict") => {
                let out = arg_after(args, "-o").unwrap();
                std::fs::write(out, b"@HD\tVN:1.6\n").unwrap();
            }
            "STAR" => {
                let dir = arg_after(args, "--genomeDir").unwrap();
                std::fs::write(Path::new(dir).join("SA"), b"sa").unwrap();
            }
            _ => {
                if let Some(output) = &self.version_output {
                    stdout = output.clone();
                }
            }
        }
        Ok(CommandOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn has_tool(&self, program: &str) -> bool {
        self.tools.contains(&program)
    }
}

pub fn workspace() -> (tempfile::TempDir, ProvisionConfig) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config =
        ProvisionConfig::new_with_roots(root.join("tools"), root.join("data"), root.join("work"));
    (temp, config)
}

pub fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
    let entries = entries
        .iter()
        .map(|(path, contents)| (*path, contents.as_bytes().to_vec()))
        .collect::<Vec<_>>();
    tarball_bytes(&entries)
}

pub fn tarball_bytes(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn catalog(json: &str) -> kira_provisioner::config::ResolvedCatalog {
    let catalog: kira_provisioner::config::Catalog = serde_json::from_str(json).unwrap();
    kira_provisioner::config::ConfigLoader::resolve_catalog(catalog, "linux").unwrap()
}
