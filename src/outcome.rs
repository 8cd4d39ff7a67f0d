use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::config::ClusterRole;
use crate::error::Error;
use crate::probe::DataDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A problem that did not stop the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!("{message}");
        Self {
            severity: Severity::Warning,
            message,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("{message}");
        Self {
            severity: Severity::Error,
            message,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Warning => write!(f, "warning: {}", self.message),
            Severity::Error => write!(f, "error: {}", self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Success,
    AlreadyDone,
    Failed,
}

/// Which path the orchestrator took after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    CleanInstall,
    InPlaceUpgrade,
    AlternateVolumeUpgrade,
    Relocation,
    RepairPriorFailure,
    AlreadyDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Start,
    Classified,
    Preflighted,
    Relocated,
    Upgraded,
    Forked,
    Finalized,
}

#[derive(Debug)]
pub struct MigrationOutcome {
    pub final_state: FinalState,
    pub branch: Option<Branch>,
    /// Last phase completed before the run ended.
    pub phase_reached: Phase,
    pub data_directories: BTreeMap<ClusterRole, DataDirectory>,
    /// The legacy data directory, when one was found and still exists.
    pub legacy_directory: Option<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
    pub error: Option<Error>,
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self.final_state,
            FinalState::Success | FinalState::AlreadyDone
        )
    }

    pub fn warnings(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.final_state, &self.error) {
            (FinalState::Failed, Some(e)) => writeln!(f, "failed: {e}")?,
            (FinalState::Failed, None) => writeln!(f, "failed")?,
            (FinalState::AlreadyDone, _) => writeln!(f, "already migrated")?,
            (FinalState::Success, _) if self.warnings() == 0 => writeln!(f, "success")?,
            (FinalState::Success, _) => {
                let n = self.warnings();
                writeln!(f, "success with {n} warning{}", if n == 1 { "" } else { "s" })?
            }
        }

        for (role, dir) in &self.data_directories {
            writeln!(f, "  {role} data: {}", dir.path.display())?;
        }
        if let Some(ref legacy) = self.legacy_directory {
            writeln!(f, "  legacy data: {}", legacy.display())?;
        }
        for diagnostic in &self.diagnostics {
            writeln!(f, "  {diagnostic}")?;
        }

        Ok(())
    }
}
