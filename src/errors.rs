//! Typed error hierarchy for the biopipe orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `PhaseError` — child-process supervision and status persistence failures
//! - `PipelineError` — dependency-ordered runner failures
//! - `SchedulerError` — admission, session layout, and configuration failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from a single phase's supervision or persistence.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Failed to spawn work process for phase {phase}: {source}")]
    SpawnFailed {
        phase: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to poll work process for phase {phase}: {source}")]
    WaitFailed {
        phase: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write status file at {path}: {source}")]
    StatusWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read status file at {path}: {source}")]
    StatusReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed status record at {path}: {source}")]
    StatusParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the pipeline runner.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No phase is ready but phases remain pending. The phase catalog is
    /// declared statically, so this is a programming error, not a runtime
    /// condition to recover from.
    #[error("No runnable phase among remaining {remaining:?}: cyclic or unknown dependency")]
    DependencyCycle { remaining: Vec<String> },

    #[error("Failed to write pipeline summary at {path}: {source}")]
    SummaryWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode pipeline summary: {0}")]
    SummaryEncodeFailed(#[source] serde_json::Error),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// Errors from the scheduler and control operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unknown phase '{phase}'; expected one of {known:?}")]
    UnknownPhase {
        phase: String,
        known: Vec<&'static str>,
    },

    #[error("No work command configured for phase '{phase}'")]
    MissingCommand { phase: String },

    #[error("Invalid session date '{date}': expected YYYY-MM-DD")]
    InvalidDate { date: String },

    #[error("Failed to create session directories under {path}: {source}")]
    SessionLayout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
