//! Phase state machine and child-process supervision.
//!
//! A `PhaseTask` is one named unit of work bound to a working directory. Its
//! work runs in a separate OS process so that cancellation can use hard
//! process termination instead of cooperative cancellation; phase work is
//! CPU/IO heavy and may call out to external interpreters. Every state
//! transition is persisted to `<work_dir>/<name>.json` before `start`
//! returns, on every exit path, so the on-disk record is the source of truth
//! after a restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::PhaseError;

/// Status of a phase, persisted as upper-case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// Phase has not run yet (or is repeatable and ready to run again)
    #[default]
    Pending,
    /// Phase work process is executing
    Running,
    /// Phase work process exited with code 0
    Success,
    /// Phase work process exited non-zero, or supervision failed
    Error,
    /// Phase was cancelled while running
    Cancelled,
}

impl PhaseStatus {
    /// Check if the phase is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if the phase completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Check if the phase can be handed to a full-pipeline run without a
    /// resume step first.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Pending | Self::Success)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "PENDING",
            PhaseStatus::Running => "RUNNING",
            PhaseStatus::Success => "SUCCESS",
            PhaseStatus::Error => "ERROR",
            PhaseStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Persisted per-phase status record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    /// Phase name
    pub name: String,
    /// Status at the time of the write
    pub status: PhaseStatus,
    /// Write time, epoch seconds
    pub timestamp: f64,
}

/// The externally supplied work for a phase: a program plus arguments,
/// already bound to a session. The core never inspects what the command
/// does; its exit code communicates success or failure.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkCommand {
    program: String,
    args: Vec<String>,
}

impl WorkCommand {
    /// Create a work command from a program and its arguments.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the tokio command for spawning.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// A named unit of work with its own state machine and on-disk status record.
///
/// Status lives behind a mutex because `cancel` may be called from a
/// different task than the one driving `start`; `cancel` only flips the
/// flag, and the supervising loop inside `start` performs the kill.
#[derive(Debug)]
pub struct PhaseTask {
    name: String,
    work: WorkCommand,
    work_dir: PathBuf,
    repeatable: bool,
    deadline: Option<Duration>,
    poll_interval: Duration,
    status: Mutex<PhaseStatus>,
}

impl PhaseTask {
    /// Default supervision poll interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Create a new phase task in the `PENDING` state.
    pub fn new(name: impl Into<String>, work: WorkCommand, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            work,
            work_dir: work_dir.into(),
            repeatable: false,
            deadline: None,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            status: Mutex::new(PhaseStatus::Pending),
        }
    }

    /// Mark the phase as repeatable: a successful run returns it to
    /// `PENDING` instead of `SUCCESS`, so it can be regenerated on demand.
    pub fn with_repeatable(mut self, repeatable: bool) -> Self {
        self.repeatable = repeatable;
        self
    }

    /// Set an execution deadline. A phase exceeding it is terminated and
    /// recorded as `ERROR`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the supervision poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Get the phase name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the phase working directory.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path of the persisted status record.
    pub fn status_file(&self) -> PathBuf {
        self.work_dir.join(format!("{}.json", self.name))
    }

    /// Current in-memory status.
    pub fn status(&self) -> PhaseStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: PhaseStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Persist the current status.
    pub fn save_state(&self) -> Result<(), PhaseError> {
        let record = PhaseRecord {
            name: self.name.clone(),
            status: self.status(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        };
        let path = self.status_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PhaseError::StatusWriteFailed {
                path: path.clone(),
                source,
            })?;
        }
        let json = serde_json::to_string(&record).map_err(|source| PhaseError::StatusParseFailed {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json)
            .map_err(|source| PhaseError::StatusWriteFailed { path, source })?;
        Ok(())
    }

    /// Adopt the persisted status if a record exists.
    ///
    /// Used after a restart to recover truth from disk instead of trusting
    /// the in-memory default of `PENDING`.
    pub fn load_state(&self) -> Result<(), PhaseError> {
        let path = self.status_file();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|source| PhaseError::StatusReadFailed {
                path: path.clone(),
                source,
            })?;
        let record: PhaseRecord = serde_json::from_str(&content)
            .map_err(|source| PhaseError::StatusParseFailed { path, source })?;
        self.set_status(record.status);
        Ok(())
    }

    /// Request cancellation. Only has effect while `RUNNING`: flips the
    /// status to `CANCELLED` and persists it. The supervising loop in
    /// `start` observes the flag and terminates the work process.
    pub fn cancel(&self) -> Result<(), PhaseError> {
        if self.status().is_running() {
            self.set_status(PhaseStatus::Cancelled);
            self.save_state()?;
            debug!(phase = %self.name, "cancellation requested");
        }
        Ok(())
    }

    /// Reset the phase to `PENDING` and persist it. Used when a queued
    /// request should show "about to run" on disk before execution starts.
    pub fn reset_to_pending(&self) -> Result<(), PhaseError> {
        self.set_status(PhaseStatus::Pending);
        self.save_state()
    }

    /// Run the phase work to completion.
    ///
    /// No-op if already `RUNNING`. Otherwise transitions to `RUNNING`,
    /// persists it, launches the work process, and supervises it until exit,
    /// cancellation, or deadline. Expected failure modes never propagate:
    /// they are converted into a persisted `ERROR`. Only a failure to write
    /// the status record itself is returned as an error.
    pub async fn start(&self) -> Result<(), PhaseError> {
        if self.status().is_running() {
            return Ok(());
        }

        self.set_status(PhaseStatus::Running);
        if let Err(err) = self.save_state() {
            // The work never launched; classify as an execution failure
            // rather than leaving a stale RUNNING in memory.
            self.set_status(PhaseStatus::Error);
            return Err(err);
        }

        let outcome = match self.supervise().await {
            Ok(status) => status,
            Err(err) => {
                warn!(phase = %self.name, error = %err, "phase supervision failed");
                PhaseStatus::Error
            }
        };

        self.set_status(outcome);
        self.save_state()?;
        debug!(phase = %self.name, status = %outcome, "phase finished");
        Ok(())
    }

    /// Supervise the work process: poll for exit, cancellation, or deadline.
    async fn supervise(&self) -> Result<PhaseStatus, PhaseError> {
        let mut cmd = self.work.command();
        cmd.current_dir(&self.work_dir);
        let mut child = cmd.spawn().map_err(|source| PhaseError::SpawnFailed {
            phase: self.name.clone(),
            source,
        })?;
        debug!(phase = %self.name, pid = ?child.id(), "work process spawned");

        let started = Instant::now();
        let mut ticks = tokio::time::interval(self.poll_interval);
        loop {
            ticks.tick().await;

            if let Some(exit) = child.try_wait().map_err(|source| PhaseError::WaitFailed {
                phase: self.name.clone(),
                source,
            })? {
                return Ok(if exit.success() {
                    if self.repeatable {
                        PhaseStatus::Pending
                    } else {
                        PhaseStatus::Success
                    }
                } else {
                    PhaseStatus::Error
                });
            }

            // A stop may arrive from another process by rewriting the
            // status record; adopt it before checking the cancel flag.
            if let Err(err) = self.load_state() {
                warn!(phase = %self.name, error = %err, "failed to reload status record");
            }
            if self.status() == PhaseStatus::Cancelled {
                debug!(phase = %self.name, "terminating cancelled work process");
                child.start_kill().ok();
                child.wait().await.ok();
                return Ok(PhaseStatus::Cancelled);
            }

            if let Some(deadline) = self.deadline
                && started.elapsed() >= deadline
            {
                warn!(phase = %self.name, ?deadline, "deadline exceeded, terminating work process");
                child.start_kill().ok();
                child.wait().await.ok();
                return Ok(PhaseStatus::Error);
            }
        }
    }
}
