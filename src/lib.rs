//! Upgrades a database data directory to the current engine version and forks the
//! server-owned databases into a cluster of their own.
//!
//! A run is driven by [`MigrationOrchestrator::run`]. It is safe to repeat: a run that finds
//! both clusters current and the fork stamped does nothing, and a run that finds an
//! interrupted fork picks it up again.

pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod fork;
pub mod health;
pub mod orchestrator;
pub mod outcome;
pub mod probe;
pub mod relocate;
pub mod service;
pub mod space;
pub mod upgrade;
pub mod version;

pub use config::{Config, MigrationRequest};
pub use error::Error;
pub use orchestrator::MigrationOrchestrator;
pub use outcome::{FinalState, MigrationOutcome};
pub use version::EngineVersion;

pub type Result<T, E = Error> = std::result::Result<T, E>;
