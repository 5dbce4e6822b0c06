//! Control operations: execute, stop, and resume.
//!
//! These are the three verbs the UI/automation layer calls. They sit on top
//! of the scheduler and the session factory, adding admission checks
//! (duplicate jobs, unmet prerequisites) and crash recovery: a phase
//! persisted `RUNNING` while the scheduler is idle means the previous
//! process died without updating status, and the resume path reclassifies it
//! to `CANCELLED` so it becomes resumable.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::errors::SchedulerError;
use crate::scheduler::{Ack, PipelineFactory, RunRequest, Scheduler};
use crate::session::{PHASE_ORDER, SessionFactory, phase_position};

/// The orchestration service: one per process, owning the scheduler.
pub struct PipelineService {
    scheduler: Arc<Scheduler>,
    factory: Arc<SessionFactory>,
}

impl PipelineService {
    /// Create the service and its scheduler. Must be called from within a
    /// tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Self {
        let factory = Arc::new(SessionFactory::new(config));
        let scheduler = Scheduler::new(Arc::clone(&factory) as Arc<dyn PipelineFactory>);
        Self { scheduler, factory }
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The session factory the service builds pipelines with.
    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    fn admission_conflict(&self, subject_id: &str) -> Option<Ack> {
        if self.scheduler.is_active(subject_id) {
            return Some(Ack::AlreadyActive {
                subject: subject_id.to_string(),
            });
        }
        if self.scheduler.is_queued(subject_id) {
            return Some(Ack::AlreadyQueued {
                subject: subject_id.to_string(),
            });
        }
        None
    }

    /// Start (or queue) a full pipeline or a single phase.
    ///
    /// Refuses when the subject already has an active or queued job. A
    /// targeted phase requires every phase strictly before it in the fixed
    /// order to be `SUCCESS` on disk. A full-pipeline request is refused
    /// when the subject's last-built pipeline holds phases outside
    /// `{PENDING, SUCCESS}`; those need `resume` first.
    pub fn execute(&self, subject_id: &str, request: RunRequest) -> Result<Ack, SchedulerError> {
        if let Some(ack) = self.admission_conflict(subject_id) {
            return Ok(ack);
        }

        if let Some(phase_name) = &request.phase {
            let position =
                phase_position(phase_name).ok_or_else(|| SchedulerError::UnknownPhase {
                    phase: phase_name.clone(),
                    known: PHASE_ORDER.to_vec(),
                })?;

            // Rebuild from disk: persisted status is the truth, whether or
            // not this process ran the earlier phases.
            let pipeline = self.factory.build(subject_id, &request)?;
            for task in pipeline.phases().values() {
                task.load_state()?;
            }

            let missing: Vec<String> = PHASE_ORDER[..position]
                .iter()
                .filter(|name| {
                    pipeline
                        .phase(name)
                        .is_none_or(|task| !task.status().is_success())
                })
                .map(|name| name.to_string())
                .collect();
            if !missing.is_empty() {
                return Ok(Ack::UnmetDependencies {
                    phase: phase_name.clone(),
                    missing,
                });
            }

            return self.scheduler.schedule(subject_id, request);
        }

        if let Some(prior) = self.scheduler.registered(subject_id) {
            let mut problematic: Vec<String> = prior
                .phases()
                .iter()
                .filter(|(_, task)| !task.status().is_clean())
                .map(|(name, _)| name.clone())
                .collect();
            if !problematic.is_empty() {
                problematic.sort();
                return Ok(Ack::NeedsResume {
                    phases: problematic,
                });
            }
        }

        self.scheduler.schedule(subject_id, request)
    }

    /// Cancel the running phases of the subject's pipeline.
    ///
    /// Works across processes: with no pipeline registered here, the
    /// session is rebuilt from disk and any phase persisted `RUNNING` is
    /// reclassified `CANCELLED`. The supervising process adopts the
    /// rewritten record on its next poll tick and terminates the work.
    pub fn stop(&self, subject_id: &str, date: &str) -> Result<Ack, SchedulerError> {
        if let Some(pipeline) = self.scheduler.registered(subject_id) {
            info!(subject = %subject_id, "stop requested");
            pipeline.cancel_all()?;
            return Ok(Ack::Stopped {
                subject: subject_id.to_string(),
            });
        }

        let pipeline = self.factory.build(subject_id, &RunRequest::full(date))?;
        for task in pipeline.phases().values() {
            task.load_state()?;
        }
        if pipeline.statuses().values().any(|s| s.is_running()) {
            info!(subject = %subject_id, "stop requested for a run owned by another process");
            pipeline.cancel_all()?;
            Ok(Ack::Stopped {
                subject: subject_id.to_string(),
            })
        } else {
            Ok(Ack::NothingToStop {
                subject: subject_id.to_string(),
            })
        }
    }

    /// Resume a previously cancelled pipeline from its first cancelled
    /// phase, reclassifying orphaned `RUNNING` records first.
    pub fn resume(&self, subject_id: &str, date: &str) -> Result<Ack, SchedulerError> {
        if let Some(ack) = self.admission_conflict(subject_id) {
            return Ok(ack);
        }

        let request = RunRequest::full(date);
        let pipeline = self.factory.build(subject_id, &request)?;
        for task in pipeline.phases().values() {
            task.load_state()?;
        }

        // A phase persisted RUNNING with no active job is an orphan: the
        // prior process terminated without updating status.
        if !self.scheduler.is_busy() {
            for name in PHASE_ORDER {
                if let Some(task) = pipeline.phase(name)
                    && task.status().is_running()
                {
                    warn!(subject = %subject_id, phase = %name, "reclassifying orphaned RUNNING phase");
                    task.cancel()?;
                }
            }
        }

        let target = PHASE_ORDER.iter().find(|name| {
            pipeline
                .phase(name)
                .is_some_and(|task| task.status() == crate::phase::PhaseStatus::Cancelled)
        });
        match target {
            None => Ok(Ack::NothingToResume {
                subject: subject_id.to_string(),
            }),
            Some(name) => {
                info!(subject = %subject_id, phase = %name, "resuming from first cancelled phase");
                self.scheduler
                    .schedule(subject_id, RunRequest::for_phase(date, *name))
            }
        }
    }
}
