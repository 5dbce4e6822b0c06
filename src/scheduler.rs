//! Single-active-job admission control.
//!
//! The `Scheduler` is a process-wide singleton: at most one pipeline runs at
//! any instant across the whole system, regardless of how many subjects have
//! pending requests. Additional requests queue FIFO and drain as the active
//! job finishes. This is admission control by policy, not a technical
//! limitation: the analysis phases are heavy enough that one pipeline at a
//! time bounds CPU contention.
//!
//! All shared state (registry, busy flag, active job, queue) sits behind one
//! mutex held only for the critical read-modify-write, never across a
//! blocking call or an await. The worker completion handler pops the queue
//! head under the lock and hands it to an mpsc requeue channel; a dispatch
//! task owned by the scheduler re-enters `schedule` from there, so no call
//! path recurses into scheduling while holding anything.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::errors::SchedulerError;
use crate::pipeline::Pipeline;

/// A request to run a pipeline for one subject session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Session date, `YYYY-MM-DD`
    pub date: String,
    /// Optional single phase to target; `None` means the full pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl RunRequest {
    /// Request a full pipeline run.
    pub fn full(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            phase: None,
        }
    }

    /// Request a run targeting a single phase.
    pub fn for_phase(date: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            phase: Some(phase.into()),
        }
    }
}

/// Acknowledgement returned by the scheduler and the control operations.
///
/// The UI layer shows the `Display` form and polls the status files for
/// detail; no variant carries more state than the short message needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// The pipeline started immediately
    Started { subject: String },
    /// The request was queued behind the active job
    Queued { subject: String, position: usize },
    /// Running phases were cancelled
    Stopped { subject: String },
    /// No pipeline is registered for the subject
    NothingToStop { subject: String },
    /// The subject already has the active job
    AlreadyActive { subject: String },
    /// The subject already has a queued request
    AlreadyQueued { subject: String },
    /// A targeted phase has earlier phases not yet successful
    UnmetDependencies { phase: String, missing: Vec<String> },
    /// A full run was refused because some phases need resuming first
    NeedsResume { phases: Vec<String> },
    /// No cancelled phase exists to resume
    NothingToResume { subject: String },
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ack::Started { subject } => {
                write!(f, "Pipeline for {subject} started immediately.")
            }
            Ack::Queued { subject, position } => {
                write!(f, "Pipeline for {subject} queued at position {position}.")
            }
            Ack::Stopped { subject } => write!(f, "Processing stopped for {subject}."),
            Ack::NothingToStop { subject } => {
                write!(f, "No active pipeline for {subject} to stop.")
            }
            Ack::AlreadyActive { subject } => {
                write!(f, "A job is already active for {subject}.")
            }
            Ack::AlreadyQueued { subject } => {
                write!(f, "A job is already queued for {subject}.")
            }
            Ack::UnmetDependencies { phase, missing } => write!(
                f,
                "Cannot run '{phase}': earlier phases not successful: {missing:?}."
            ),
            Ack::NeedsResume { phases } => write!(
                f,
                "Cannot start a full pipeline: phases {phases:?} are cancelled or failed. Use continue to resume."
            ),
            Ack::NothingToResume { subject } => {
                write!(f, "No cancelled phase for {subject} to resume.")
            }
        }
    }
}

/// Builds a pipeline for a scheduling request.
///
/// The scheduler rebuilds the pipeline on every request so that the admitted
/// job always reflects the latest phase configuration; the factory is the
/// seam where the session layout and work commands come from.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, subject_id: &str, request: &RunRequest) -> Result<Pipeline, SchedulerError>;
}

#[derive(Default)]
struct SchedulerState {
    /// subject id -> last-built pipeline, for status inspection without
    /// rebuilding from disk
    registry: HashMap<String, Arc<Pipeline>>,
    /// true iff some pipeline is actively executing
    busy: bool,
    /// subject of the pipeline currently running
    active_job: Option<String>,
    /// pending requests, FIFO, no duplicate subjects (enforced by the
    /// control operations)
    queue: VecDeque<(String, RunRequest)>,
    /// entries popped from the queue but not yet re-entered through
    /// `schedule` by the dispatch task
    in_flight: usize,
}

/// Process-wide single-active-job scheduler.
pub struct Scheduler {
    factory: Arc<dyn PipelineFactory>,
    inner: Mutex<SchedulerState>,
    requeue_tx: mpsc::UnboundedSender<(String, RunRequest)>,
}

impl Scheduler {
    /// Create the scheduler and spawn its dispatch task.
    ///
    /// Must be called from within a tokio runtime. The dispatch task drains
    /// the requeue channel for the life of the process.
    pub fn new(factory: Arc<dyn PipelineFactory>) -> Arc<Self> {
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            factory,
            inner: Mutex::new(SchedulerState::default()),
            requeue_tx,
        });

        let dispatch = Arc::clone(&scheduler);
        tokio::spawn(async move {
            while let Some((subject, request)) = requeue_rx.recv().await {
                if let Err(err) = dispatch.schedule(&subject, request) {
                    error!(subject = %subject, error = %err, "failed to start queued pipeline");
                }
                dispatch.state().in_flight -= 1;
            }
        });

        scheduler
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether some pipeline is actively executing.
    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    /// Subject of the currently active job, if any.
    pub fn active_job(&self) -> Option<String> {
        self.state().active_job.clone()
    }

    /// Whether the subject holds the active job.
    pub fn is_active(&self, subject_id: &str) -> bool {
        self.state().active_job.as_deref() == Some(subject_id)
    }

    /// Whether the subject has a queued request.
    pub fn is_queued(&self, subject_id: &str) -> bool {
        self.state().queue.iter().any(|(s, _)| s == subject_id)
    }

    /// The last-built pipeline for a subject, if any.
    pub fn registered(&self, subject_id: &str) -> Option<Arc<Pipeline>> {
        self.state().registry.get(subject_id).cloned()
    }

    /// Whether the scheduler has no active job, no queued requests, and
    /// nothing between the queue and the dispatch task.
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        !state.busy && state.queue.is_empty() && state.in_flight == 0
    }

    /// Run or enqueue the pipeline for `subject_id`.
    ///
    /// Always rebuilds the pipeline and stores it in the registry. If the
    /// slot is free the run starts on a background task; otherwise the
    /// request queues FIFO and its phase statuses are reset to `PENDING` on
    /// disk so they read as "about to run" while waiting.
    pub fn schedule(
        self: &Arc<Self>,
        subject_id: &str,
        request: RunRequest,
    ) -> Result<Ack, SchedulerError> {
        let pipeline = Arc::new(self.factory.build(subject_id, &request)?);

        let position = {
            let mut state = self.state();
            state
                .registry
                .insert(subject_id.to_string(), Arc::clone(&pipeline));
            if state.busy {
                state.queue.push_back((subject_id.to_string(), request.clone()));
                // Queue-time marking stays under the lock: the finishing
                // worker cannot pop this entry until the PENDING records
                // are on disk, so a fresh run never races the writes.
                match &request.phase {
                    Some(phase_name) => {
                        if let Some(task) = pipeline.phase(phase_name) {
                            task.reset_to_pending()?;
                        }
                    }
                    None => {
                        for task in pipeline.phases().values() {
                            task.reset_to_pending()?;
                        }
                        pipeline.save_summary()?;
                    }
                }
                Some(state.queue.len())
            } else {
                state.busy = true;
                state.active_job = Some(subject_id.to_string());
                None
            }
        };

        match position {
            None => {
                self.spawn_worker(subject_id.to_string(), pipeline);
                info!(subject = %subject_id, "pipeline started immediately");
                Ok(Ack::Started {
                    subject: subject_id.to_string(),
                })
            }
            Some(position) => {
                info!(subject = %subject_id, position, "pipeline queued");
                Ok(Ack::Queued {
                    subject: subject_id.to_string(),
                    position,
                })
            }
        }
    }

    /// Run the pipeline on a background task; on completion free the slot
    /// and hand the next queued request to the dispatch task.
    fn spawn_worker(self: &Arc<Self>, subject_id: String, pipeline: Arc<Pipeline>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = pipeline.run().await {
                error!(subject = %subject_id, error = %err, "pipeline run failed");
            }

            let next = {
                let mut state = scheduler.state();
                state.busy = false;
                state.active_job = None;
                let next = state.queue.pop_front();
                if next.is_some() {
                    state.in_flight += 1;
                }
                next
            };

            if let Some(entry) = next {
                // Outside the lock; the dispatch task re-enters schedule.
                scheduler.requeue_tx.send(entry).ok();
            }
        });
    }
}
