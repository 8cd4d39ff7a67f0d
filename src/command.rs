//! Typed invocation of external tools.
//!
//! Every helper binary the orchestrator relies on is described by a [`ToolCommand`]: a program,
//! a structured argument list, an explicit working directory and the account to run as. Nothing
//! is ever passed through a shell.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;

use crate::error::{Error, ToolStatus};
use crate::relocate::Owner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub run_as: Option<Owner>,
    pub env: Vec<(OsString, OsString)>,
    /// Send standard output to this file instead of capturing it.
    pub stdout_to: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            run_as: None,
            env: Vec::new(),
            stdout_to: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn run_as(mut self, owner: Option<Owner>) -> Self {
        self.run_as = owner;
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    /// Short name used in logs and errors.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Value following `flag` in the argument list, if any.
    pub fn flag_value(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool: String,
    pub status: ToolStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == ToolStatus::Exited(0)
    }

    /// Turns a non-zero exit into an [`Error::ExternalTool`].
    pub fn check(self) -> crate::Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ExternalTool {
                tool: self.tool,
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion. Only failures to spawn are reported as `Err`; a tool
    /// exiting with a non-zero status is reported through [`ToolOutput::status`].
    async fn run(&self, cmd: &ToolCommand) -> crate::Result<ToolOutput>;
}

/// Runs tools as child processes of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &ToolCommand) -> crate::Result<ToolOutput> {
        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = cmd.current_dir {
            command.current_dir(dir);
        }

        match cmd.stdout_to {
            Some(ref path) => {
                let file = std::fs::File::create(path).map_err(Error::io(path))?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }

        if let Some(owner) = cmd.run_as {
            if nix::unistd::geteuid().is_root() {
                command.uid(owner.uid).gid(owner.gid);
            }
        }

        tracing::debug!("running `{cmd}`");

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!("failed to spawn `{}`: {e}", cmd.program.display());
                return Ok(ToolOutput {
                    tool: cmd.tool_name(),
                    status: ToolStatus::SpawnFailed,
                    stdout: String::new(),
                    stderr: e.to_string(),
                });
            }
        };

        Ok(ToolOutput {
            tool: cmd.tool_name(),
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn bin(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
