use std::path::PathBuf;
use std::process::ExitStatus;

use crate::config::ClusterRole;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid state at `{}`: {reason}", .path.display())]
    Validation { path: PathBuf, reason: String },
    #[error("not enough space on `{}`: need {needed} bytes, {available} available", .volume.display())]
    InsufficientSpace {
        volume: PathBuf,
        needed: u64,
        available: u64,
    },
    #[error("io error on `{}`: {source}", .path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to overwrite existing path `{}`", .0.display())]
    DestinationExists(PathBuf),
    #[error("`{tool}` failed ({status}){}", format_stderr(.stderr))]
    ExternalTool {
        tool: String,
        status: ToolStatus,
        stderr: String,
    },
    #[error("{role} cluster did not become ready after {attempts} attempts")]
    HealthCheckTimeout { role: ClusterRole, attempts: u32 },
    #[error("service `{service}` error: {reason}")]
    Service { service: String, reason: String },
    #[error("data was already migrated")]
    AlreadyMigrated,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Internal Error: `{0}`")]
    Internal(String),
}

/// How an external tool terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Exited(i32),
    Signaled,
    SpawnFailed,
}

impl From<ExitStatus> for ToolStatus {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Exited(code),
            None => Self::Signaled,
        }
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolStatus::Exited(code) => write!(f, "exit code {code}"),
            ToolStatus::Signaled => f.write_str("killed by signal"),
            ToolStatus::SpawnFailed => f.write_str("could not be spawned"),
        }
    }
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl Error {
    pub fn validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Resource { path, source }
    }
}
