//! Dependency-ordered pipeline execution.
//!
//! A `Pipeline` owns the phase tasks for one subject session plus the map of
//! prerequisites between them. `run` executes in rounds: every phase whose
//! prerequisites are all completed launches concurrently, the round is
//! awaited as a whole, and the summary is persisted after it. A `CANCELLED`
//! or `ERROR` phase stops the run immediately; the phase chain here is a
//! strict near-linear graph, so continuing unrelated branches would only
//! mask the failure.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{PhaseError, PipelineError};
use crate::phase::{PhaseStatus, PhaseTask};

/// File name of the persisted pipeline summary.
pub const SUMMARY_FILE: &str = "pipeline.json";

/// The set of phases and their dependency map for one subject session.
///
/// Pipelines are rebuilt on every scheduling request and discarded once the
/// run loop returns; their effects persist on disk.
#[derive(Debug)]
pub struct Pipeline {
    subject_id: String,
    phases: HashMap<String, Arc<PhaseTask>>,
    dependencies: HashMap<String, Vec<String>>,
    root_dir: PathBuf,
}

impl Pipeline {
    /// Create a pipeline from phase tasks and their prerequisite map.
    pub fn new(
        subject_id: impl Into<String>,
        phases: HashMap<String, Arc<PhaseTask>>,
        dependencies: HashMap<String, Vec<String>>,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            phases,
            dependencies,
            root_dir: root_dir.into(),
        }
    }

    /// The subject this pipeline processes.
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Session root directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Look up a phase task by name.
    pub fn phase(&self, name: &str) -> Option<&Arc<PhaseTask>> {
        self.phases.get(name)
    }

    /// All phase tasks.
    pub fn phases(&self) -> &HashMap<String, Arc<PhaseTask>> {
        &self.phases
    }

    /// Path of the persisted pipeline summary.
    pub fn summary_file(&self) -> PathBuf {
        self.root_dir.join(SUMMARY_FILE)
    }

    /// Snapshot of in-memory phase statuses, ordered by name.
    pub fn statuses(&self) -> BTreeMap<String, PhaseStatus> {
        self.phases
            .iter()
            .map(|(name, task)| (name.clone(), task.status()))
            .collect()
    }

    /// Persist the pipeline summary: `{phaseName: status, ...}`.
    pub fn save_summary(&self) -> Result<(), PipelineError> {
        let summary: BTreeMap<&str, String> = self
            .phases
            .iter()
            .map(|(name, task)| (name.as_str(), task.status().to_string()))
            .collect();
        let path = self.summary_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::SummaryWriteFailed {
                path: path.clone(),
                source,
            })?;
        }
        let json = serde_json::to_string(&summary).map_err(PipelineError::SummaryEncodeFailed)?;
        std::fs::write(&path, json)
            .map_err(|source| PipelineError::SummaryWriteFailed { path, source })?;
        Ok(())
    }

    /// Cancel every phase currently `RUNNING`, then persist the summary.
    /// Phases not running are unaffected.
    pub fn cancel_all(&self) -> Result<(), PipelineError> {
        for (name, task) in &self.phases {
            task.load_state()?;
            if task.status().is_running() {
                info!(subject = %self.subject_id, phase = %name, "cancelling running phase");
                task.cancel()?;
            }
        }
        self.save_summary()?;
        Ok(())
    }

    /// Execute the pipeline in dependency order.
    ///
    /// Each round launches the ready phases concurrently and awaits them
    /// all. A phase whose persisted status is already `SUCCESS` is marked
    /// completed without re-running, which makes resumption idempotent. The
    /// run stops after any round that produced a `CANCELLED` or `ERROR`
    /// phase; the failure is recorded on disk, never retried here.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let mut pending: HashSet<String> = self.phases.keys().cloned().collect();
        let mut completed: HashSet<String> = HashSet::new();

        while !pending.is_empty() {
            let ready: Vec<String> = pending
                .iter()
                .filter(|name| {
                    self.dependencies
                        .get(*name)
                        .map(|deps| deps.iter().all(|d| completed.contains(d)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                let mut remaining: Vec<String> = pending.into_iter().collect();
                remaining.sort();
                return Err(PipelineError::DependencyCycle { remaining });
            }

            let mut launched: Vec<(String, Arc<PhaseTask>)> = Vec::new();
            for name in &ready {
                pending.remove(name);
                let task = &self.phases[name];
                task.load_state()?;
                if task.status().is_success() {
                    debug!(subject = %self.subject_id, phase = %name, "already complete, skipping");
                    completed.insert(name.clone());
                } else {
                    launched.push((name.clone(), Arc::clone(task)));
                }
            }

            if launched.is_empty() {
                continue;
            }

            info!(
                subject = %self.subject_id,
                phases = ?launched.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                "starting round"
            );
            let results = join_all(
                launched
                    .iter()
                    .map(|(_, task)| {
                        let task = Arc::clone(task);
                        async move { task.start().await }
                    })
                    .collect::<Vec<_>>(),
            )
            .await;
            for err in results.into_iter().filter_map(Result::err) {
                // Persistence failed mid-round; the phase status itself
                // already reflects the outcome, so log and carry on.
                warn!(subject = %self.subject_id, error = %err, "phase state write failed");
            }

            let mut halted = false;
            for (name, task) in &launched {
                match task.status() {
                    PhaseStatus::Success => {
                        completed.insert(name.clone());
                    }
                    PhaseStatus::Cancelled | PhaseStatus::Error => halted = true,
                    _ => {}
                }
            }

            self.save_summary()?;
            if halted {
                info!(subject = %self.subject_id, "pipeline halted after failed or cancelled round");
                return Ok(());
            }
        }

        info!(subject = %self.subject_id, "pipeline run complete");
        Ok(())
    }
}

/// Read a persisted pipeline summary, if one exists.
pub fn read_summary(root_dir: &Path) -> Result<Option<BTreeMap<String, String>>, PhaseError> {
    let path = root_dir.join(SUMMARY_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(&path).map_err(|source| PhaseError::StatusReadFailed {
            path: path.clone(),
            source,
        })?;
    let summary = serde_json::from_str(&content)
        .map_err(|source| PhaseError::StatusParseFailed { path, source })?;
    Ok(Some(summary))
}
