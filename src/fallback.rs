use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8Path;

use crate::command::{CommandSpec, ExecutionContext, Executor};
use crate::domain::{AcquisitionAttempt, FetchHook, StrategyKind};
use crate::error::KiraError;
use crate::fetch::{Retriever, artifact_name};
use crate::fs_util;
use crate::template::{self, TemplateVars};

/// A successfully fetched (and hooked) artifact. Lives only as long as the
/// scoped working directory it was fetched into.
#[derive(Debug)]
pub struct Acquired<'a> {
    pub path: PathBuf,
    pub workdir: &'a Path,
    pub url: String,
    pub strategy: StrategyKind,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAttempt {
    pub strategy: StrategyKind,
    pub url: String,
    pub mandatory: bool,
}

/// Walks an ordered list of acquisition attempts until one succeeds.
pub struct FallbackEngine<'a> {
    retriever: &'a dyn Retriever,
    executor: &'a dyn Executor,
    work_root: &'a Utf8Path,
    host: &'a str,
}

impl<'a> FallbackEngine<'a> {
    pub fn new(
        retriever: &'a dyn Retriever,
        executor: &'a dyn Executor,
        work_root: &'a Utf8Path,
        host: &'a str,
    ) -> Self {
        Self {
            retriever,
            executor,
            work_root,
            host,
        }
    }

    pub fn plan(
        &self,
        attempts: &[AcquisitionAttempt],
        vars: &TemplateVars,
    ) -> Result<Vec<PlannedAttempt>, KiraError> {
        attempts
            .iter()
            .map(|attempt| {
                Ok(PlannedAttempt {
                    strategy: attempt.strategy,
                    url: template::expand(&attempt.url, vars)?,
                    mandatory: attempt.mandatory,
                })
            })
            .collect()
    }

    /// Fetches through the first attempt that succeeds and hands the result to
    /// `consume` while the working directory still exists. Returns `Ok(None)`
    /// when every attempt came up empty and none of them was mandatory.
    pub fn acquire_with<T, F>(
        &self,
        label: &str,
        attempts: &[AcquisitionAttempt],
        vars: &TemplateVars,
        consume: F,
    ) -> Result<Option<T>, KiraError>
    where
        F: FnOnce(&Acquired<'_>) -> Result<T, KiraError>,
    {
        let planned = self.plan(attempts, vars)?;
        let Some(first) = planned.first() else {
            return Err(KiraError::InvalidCatalog(format!(
                "{label} has no acquisition attempts"
            )));
        };

        fs::create_dir_all(self.work_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let workdir = tempfile::Builder::new()
            .prefix(&scoped_prefix(self.host, &artifact_name(&first.url)))
            .tempdir_in(self.work_root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;

        let mut mandatory_failed = false;
        let mut last_error = None;
        for (index, (attempt, plan)) in attempts.iter().zip(&planned).enumerate() {
            let attempt_dir = workdir.path().join(format!("attempt-{index}"));
            fs::create_dir_all(&attempt_dir)
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let destination = attempt_dir.join(artifact_name(&plan.url));

            match self
                .retriever
                .retrieve(plan.strategy, &plan.url, &destination)
            {
                Ok(path) => {
                    tracing::info!(label, url = %plan.url, attempt = index, "acquired");
                    let path = self.apply_hooks(&attempt.post_fetch, path, &attempt_dir)?;
                    let acquired = Acquired {
                        path,
                        workdir: workdir.path(),
                        url: plan.url.clone(),
                        strategy: plan.strategy,
                        index,
                    };
                    return consume(&acquired).map(Some);
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        label,
                        url = %plan.url,
                        mandatory = attempt.mandatory,
                        error = %err,
                        "acquisition attempt failed, trying next"
                    );
                    mandatory_failed |= attempt.mandatory;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let last = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt ran".to_string());
        if mandatory_failed {
            return Err(KiraError::Exhausted {
                resource: label.to_string(),
                last,
            });
        }
        tracing::warn!(label, last = %last, "optional resource unavailable, skipping");
        Ok(None)
    }

    fn apply_hooks(
        &self,
        hooks: &[FetchHook],
        mut path: PathBuf,
        attempt_dir: &Path,
    ) -> Result<PathBuf, KiraError> {
        for hook in hooks {
            match hook {
                FetchHook::Keep => {}
                FetchHook::Unpack => {
                    if path.is_dir() {
                        continue;
                    }
                    let target = attempt_dir.join("unpacked");
                    fs_util::unpack(&path, &target)?;
                    fs::remove_file(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
                    path = fs_util::single_top_level_dir(&target)?.unwrap_or(target);
                }
                FetchHook::Run { program, args } => {
                    let dir = if path.is_dir() {
                        path.clone()
                    } else {
                        attempt_dir.to_path_buf()
                    };
                    let dir = camino::Utf8PathBuf::from_path_buf(dir)
                        .map_err(|_| KiraError::Filesystem("non-utf8 work path".to_string()))?;
                    let spec = CommandSpec::new(program.as_str(), args.iter().cloned())?;
                    ExecutionContext::new(self.host, dir).run_checked(self.executor, spec)?;
                }
            }
        }
        Ok(path)
    }
}

/// `<host>-<timestamp>-<file>-`; tempfile appends a random suffix.
pub fn scoped_prefix(host: &str, file_name: &str) -> String {
    let sanitize = |value: &str| {
        value
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                    ch
                } else {
                    '_'
                }
            })
            .collect::<String>()
    };
    format!(
        "{}-{}-{}-",
        sanitize(host),
        chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"),
        sanitize(file_name)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::command::CommandOutput;

    struct ScriptedRetriever {
        outcomes: Mutex<Vec<Result<&'static [u8], KiraError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRetriever {
        fn new(outcomes: Vec<Result<&'static [u8], KiraError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Retriever for ScriptedRetriever {
        fn retrieve(
            &self,
            _strategy: StrategyKind,
            url: &str,
            destination: &Path,
        ) -> Result<PathBuf, KiraError> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.outcomes.lock().unwrap().remove(0) {
                Ok(bytes) => {
                    std::fs::write(destination, bytes).unwrap();
                    Ok(destination.to_path_buf())
                }
                Err(err) => Err(err),
            }
        }
    }

    struct NoExec;

    impl Executor for NoExec {
        fn run(&self, _command: &CommandSpec) -> Result<CommandOutput, KiraError> {
            Err(KiraError::MissingTool("none".to_string()))
        }

        fn has_tool(&self, _program: &str) -> bool {
            false
        }
    }

    fn attempts(mandatory_last: bool) -> Vec<AcquisitionAttempt> {
        let mut list = vec![
            AcquisitionAttempt::new(StrategyKind::ObjectStore, "s3://mirror/{name}.fa", false),
            AcquisitionAttempt::new(StrategyKind::Ftp, "ftp://upstream/{name}.fa", false),
            AcquisitionAttempt::new(StrategyKind::Http, "https://upstream/{name}.fa", mandatory_last),
        ];
        for attempt in &mut list {
            attempt.post_fetch = vec![FetchHook::Keep];
        }
        list
    }

    fn work_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("work")).unwrap();
        (temp, root)
    }

    #[test]
    fn stops_at_first_success() {
        let (_temp, root) = work_root();
        let retriever = ScriptedRetriever::new(vec![
            Err(KiraError::NotFound("mirror".to_string())),
            Ok(b">chrM\nACGT\n"),
            Ok(b"unused"),
        ]);
        let engine = FallbackEngine::new(&retriever, &NoExec, &root, "node-1");
        let vars = TemplateVars::new().with("name", "chrM");

        let content = engine
            .acquire_with("chrM", &attempts(true), &vars, |acquired| {
                assert_eq!(acquired.index, 1);
                Ok(std::fs::read_to_string(&acquired.path).unwrap())
            })
            .unwrap();

        assert_eq!(content.as_deref(), Some(">chrM\nACGT\n"));
        assert_eq!(
            *retriever.calls.lock().unwrap(),
            vec!["s3://mirror/chrM.fa", "ftp://upstream/chrM.fa"]
        );
    }

    #[test]
    fn mandatory_exhaustion_is_terminal() {
        let (_temp, root) = work_root();
        let retriever = ScriptedRetriever::new(vec![
            Err(KiraError::NotFound("a".to_string())),
            Err(KiraError::Timeout("b".to_string())),
            Err(KiraError::NotFound("c".to_string())),
        ]);
        let engine = FallbackEngine::new(&retriever, &NoExec, &root, "node-1");
        let vars = TemplateVars::new().with("name", "x");
        let err = engine
            .acquire_with("x", &attempts(true), &vars, |_| Ok(()))
            .unwrap_err();
        assert_matches!(err, KiraError::Exhausted { .. });
    }

    #[test]
    fn missing_transfer_tool_stops_the_chain() {
        let (_temp, root) = work_root();
        let retriever = ScriptedRetriever::new(vec![
            Err(KiraError::MissingTool("aws".to_string())),
            Ok(b">chrM\nACGT\n"),
            Ok(b"unused"),
        ]);
        let engine = FallbackEngine::new(&retriever, &NoExec, &root, "node-1");
        let vars = TemplateVars::new().with("name", "chrM");
        let err = engine
            .acquire_with("chrM", &attempts(false), &vars, |_| Ok(()))
            .unwrap_err();
        assert_matches!(err, KiraError::MissingTool(tool) if tool == "aws");
        assert_eq!(*retriever.calls.lock().unwrap(), vec!["s3://mirror/chrM.fa"]);
    }

    #[test]
    fn optional_exhaustion_is_tolerated() {
        let (_temp, root) = work_root();
        let retriever = ScriptedRetriever::new(vec![
            Err(KiraError::NotFound("a".to_string())),
            Err(KiraError::NotFound("b".to_string())),
            Err(KiraError::NotFound("c".to_string())),
        ]);
        let engine = FallbackEngine::new(&retriever, &NoExec, &root, "node-1");
        let vars = TemplateVars::new().with("name", "x");
        let result = engine
            .acquire_with("x", &attempts(false), &vars, |_| Ok(()))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn non_transient_error_stops_chain() {
        let (_temp, root) = work_root();
        let retriever = ScriptedRetriever::new(vec![
            Err(KiraError::HttpStatus {
                url: "s3://mirror/x.fa".to_string(),
                status: 500,
                message: "boom".to_string(),
            }),
            Ok(b"unused"),
            Ok(b"unused"),
        ]);
        let engine = FallbackEngine::new(&retriever, &NoExec, &root, "node-1");
        let vars = TemplateVars::new().with("name", "x");
        let err = engine
            .acquire_with("x", &attempts(true), &vars, |_| Ok(()))
            .unwrap_err();
        assert_matches!(err, KiraError::HttpStatus { status: 500, .. });
        assert_eq!(retriever.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn workdir_removed_after_success_and_failure() {
        let (_temp, root) = work_root();
        let retriever = ScriptedRetriever::new(vec![Ok(b"data"), Ok(b"data")]);
        let engine = FallbackEngine::new(&retriever, &NoExec, &root, "node-1");
        let vars = TemplateVars::new().with("name", "x");
        let list = attempts(true);

        let seen = engine
            .acquire_with("x", &list, &vars, |acquired| Ok(acquired.workdir.to_path_buf()))
            .unwrap()
            .unwrap();
        assert!(!seen.exists());

        let mut seen_on_error = None;
        let err = engine
            .acquire_with("x", &list, &vars, |acquired| {
                seen_on_error = Some(acquired.workdir.to_path_buf());
                Err::<(), _>(KiraError::Filesystem("disk full".to_string()))
            })
            .unwrap_err();
        assert_matches!(err, KiraError::Filesystem(_));
        assert!(!seen_on_error.unwrap().exists());
    }

    #[test]
    fn scoped_prefix_carries_host_and_file() {
        let prefix = scoped_prefix("build host:22", "bwa-0.7.17.tar.gz");
        assert!(prefix.starts_with("build_host_22-"));
        assert!(prefix.ends_with("-bwa-0.7.17.tar.gz-"));
    }
}
