use std::fmt;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::KiraError;

/// A program invocation as an argument vector. Nothing here is ever passed
/// through a shell, so arguments need no quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    current_dir: Option<Utf8PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Result<Self, KiraError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(KiraError::InvalidCommand("empty program name".to_string()));
        }
        if program.contains('\0') {
            return Err(KiraError::InvalidCommand(format!(
                "program name contains NUL: {program:?}"
            )));
        }
        let args = args.into_iter().map(Into::into).collect::<Vec<String>>();
        if let Some(bad) = args.iter().find(|arg| arg.contains('\0')) {
            return Err(KiraError::InvalidCommand(format!(
                "argument contains NUL: {bad:?}"
            )));
        }
        Ok(Self {
            program,
            args,
            current_dir: None,
        })
    }

    pub fn in_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn current_dir(&self) -> Option<&Utf8Path> {
        self.current_dir.as_deref()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:,+@%".contains(ch));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands on the target host.
pub trait Executor: Send + Sync {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, KiraError>;
    fn has_tool(&self, program: &str) -> bool;

    fn run_checked(&self, command: &CommandSpec) -> Result<CommandOutput, KiraError> {
        let output = self.run(command)?;
        if output.success() {
            return Ok(output);
        }
        let stderr = output.stderr.trim().to_string();
        Err(KiraError::Command {
            program: command.program().to_string(),
            code: output.code,
            stderr: if stderr.is_empty() {
                format!("command failed: {command}")
            } else {
                stderr
            },
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for LocalExecutor {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, KiraError> {
        tracing::debug!(command = %command, "running");
        let mut cmd = Command::new(command.program());
        cmd.args(command.args());
        if let Some(dir) = command.current_dir() {
            cmd.current_dir(dir.as_std_path());
        }
        let output = cmd.output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                KiraError::MissingTool(command.program().to_string())
            } else {
                KiraError::Command {
                    program: command.program().to_string(),
                    code: None,
                    stderr: err.to_string(),
                }
            }
        })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn has_tool(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Per-host state for one unit of work: which host commands target and the
/// directory they run in unless they name their own.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    host: String,
    cwd: Utf8PathBuf,
}

impl ExecutionContext {
    pub fn new(host: impl Into<String>, cwd: impl Into<Utf8PathBuf>) -> Self {
        Self {
            host: host.into(),
            cwd: cwd.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn cwd(&self) -> &Utf8Path {
        &self.cwd
    }

    pub fn change_dir(&mut self, dir: impl Into<Utf8PathBuf>) {
        self.cwd = dir.into();
    }

    /// Pins `command` to the context directory when it has none, then runs it.
    pub fn run_checked(
        &self,
        executor: &dyn Executor,
        command: CommandSpec,
    ) -> Result<CommandOutput, KiraError> {
        let command = if command.current_dir().is_some() {
            command
        } else {
            command.in_dir(self.cwd.clone())
        };
        tracing::debug!(host = %self.host, cwd = ?command.current_dir(), command = %command, "dispatching");
        executor.run_checked(&command)
    }
}
