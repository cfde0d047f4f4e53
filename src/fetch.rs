use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::command::{CommandSpec, Executor};
use crate::domain::StrategyKind;
use crate::error::KiraError;

/// Fetches one artifact with one strategy. `destination` is the full path the
/// artifact should land at; the returned path is where it actually landed.
pub trait Retriever: Send + Sync {
    fn retrieve(
        &self,
        strategy: StrategyKind,
        url: &str,
        destination: &Path,
    ) -> Result<PathBuf, KiraError>;
}

/// Last path segment of a URL without query or fragment.
pub fn artifact_name(url: &str) -> String {
    let trimmed = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    let name = trimmed.rsplit('/').next().unwrap_or_default();
    let name = name.trim_end_matches(".git");
    if name.is_empty() || name.contains(':') {
        "download".to_string()
    } else {
        name.to_string()
    }
}

/// Public HTTPS endpoint for an `s3://bucket/key` URL. Other URLs pass through.
pub fn object_store_url(url: &str) -> Result<String, KiraError> {
    let Some(rest) = url.strip_prefix("s3://") else {
        return Ok(url.to_string());
    };
    let (bucket, key) = rest
        .split_once('/')
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| KiraError::InvalidTemplate {
            template: url.to_string(),
            message: "expected s3://bucket/key".to_string(),
        })?;
    Ok(format!("https://{bucket}.s3.amazonaws.com/{key}"))
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-prov/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60 * 60))
            .build()
            .map_err(|err| KiraError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        missing_statuses: &[u16],
    ) -> Result<(), KiraError> {
        let mut response = self.send_with_retries(url, || self.client.get(url))?;
        let status = response.status().as_u16();
        if missing_statuses.contains(&status) {
            return Err(KiraError::NotFound(format!("{url} (status {status})")));
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(KiraError::HttpStatus {
                url: url.to_string(),
                status,
                message,
            });
        }
        let mut file =
            File::create(destination).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file).map_err(|err| {
            if is_timeout_io(&err) {
                KiraError::Timeout(format!("{url}: {err}"))
            } else {
                KiraError::Filesystem(err.to_string())
            }
        })?;
        Ok(())
    }

    pub fn upload(&self, url: &str, source: &Path) -> Result<(), KiraError> {
        let payload = std::fs::read(source)
            .map_err(|err| KiraError::Filesystem(format!("read {}: {err}", source.display())))?;
        let response =
            self.send_with_retries(url, || self.client.put(url).body(payload.clone()))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "upload failed".to_string());
        Err(KiraError::HttpStatus {
            url: url.to_string(),
            status,
            message,
        })
    }

    fn send_with_retries<F>(&self, url: &str, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    if err.is_timeout() || err.is_connect() {
                        return Err(KiraError::Timeout(format!("{url}: {err}")));
                    }
                    return Err(KiraError::Http(err.to_string()));
                }
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn is_timeout_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::ConnectionReset
    )
}

/// The production retriever: HTTP in-process, everything else through host tools.
pub struct NetworkRetriever<E: Executor> {
    http: HttpFetcher,
    executor: E,
}

impl<E: Executor> NetworkRetriever<E> {
    pub fn new(http: HttpFetcher, executor: E) -> Self {
        Self { http, executor }
    }

    fn require_tool(&self, tool: &str) -> Result<(), KiraError> {
        if self.executor.has_tool(tool) {
            Ok(())
        } else {
            Err(KiraError::MissingTool(tool.to_string()))
        }
    }

    fn ftp(&self, url: &str, destination: &Path) -> Result<PathBuf, KiraError> {
        self.require_tool("curl")?;
        let spec = CommandSpec::new(
            "curl",
            [
                "-fsSL".to_string(),
                "--ftp-pasv".to_string(),
                "--retry".to_string(),
                "3".to_string(),
                "-o".to_string(),
                destination.to_string_lossy().to_string(),
                url.to_string(),
            ],
        )?;
        let output = self.executor.run(&spec)?;
        match output.code {
            Some(0) => Ok(destination.to_path_buf()),
            // 9: access denied, 19: RETR failed, 78: remote file not found
            Some(9 | 19 | 78) => Err(KiraError::NotFound(url.to_string())),
            Some(6 | 7 | 28) => Err(KiraError::Timeout(url.to_string())),
            code => Err(KiraError::Command {
                program: "curl".to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    fn rsync(&self, url: &str, destination: &Path) -> Result<PathBuf, KiraError> {
        self.require_tool("rsync")?;
        let spec = CommandSpec::new(
            "rsync",
            [
                "-a".to_string(),
                "--partial".to_string(),
                "--timeout=300".to_string(),
                url.to_string(),
                destination.to_string_lossy().to_string(),
            ],
        )?;
        let output = self.executor.run(&spec)?;
        match output.code {
            Some(0) => Ok(destination.to_path_buf()),
            // 23: partial transfer due to error (missing source), 24: vanished source
            Some(23 | 24) => Err(KiraError::NotFound(url.to_string())),
            Some(10 | 30 | 35) => Err(KiraError::Timeout(url.to_string())),
            code => Err(KiraError::Command {
                program: "rsync".to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    fn vcs(&self, url: &str, destination: &Path) -> Result<PathBuf, KiraError> {
        self.require_tool("git")?;
        let url = url.strip_prefix("git+").unwrap_or(url);
        let (repo, reference) = match url.rsplit_once('#') {
            Some((repo, reference)) if !reference.is_empty() => (repo, Some(reference)),
            _ => (url, None),
        };
        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        if let Some(reference) = reference {
            args.push("--branch".to_string());
            args.push(reference.to_string());
        }
        args.push(repo.to_string());
        args.push(destination.to_string_lossy().to_string());
        let spec = CommandSpec::new("git", args)?;
        let output = self.executor.run(&spec)?;
        if output.success() {
            return Ok(destination.to_path_buf());
        }
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("not found") || stderr.contains("does not exist") {
            return Err(KiraError::NotFound(repo.to_string()));
        }
        if stderr.contains("timed out") || stderr.contains("could not resolve host") {
            return Err(KiraError::Timeout(repo.to_string()));
        }
        Err(KiraError::Command {
            program: "git".to_string(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

impl<E: Executor> Retriever for NetworkRetriever<E> {
    fn retrieve(
        &self,
        strategy: StrategyKind,
        url: &str,
        destination: &Path,
    ) -> Result<PathBuf, KiraError> {
        tracing::info!(%strategy, url, "fetching");
        match strategy {
            StrategyKind::Http => {
                self.http.download(url, destination, &[404, 410])?;
                Ok(destination.to_path_buf())
            }
            StrategyKind::ObjectStore => {
                let url = object_store_url(url)?;
                // S3 answers 403 for missing keys on buckets without list access.
                self.http.download(&url, destination, &[403, 404])?;
                Ok(destination.to_path_buf())
            }
            StrategyKind::Ftp => self.ftp(url, destination),
            StrategyKind::Rsync => self.rsync(url, destination),
            StrategyKind::Vcs => self.vcs(url, destination),
        }
    }
}
