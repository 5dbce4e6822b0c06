//! Session layout and the fixed phase catalog.
//!
//! A session is one subject + date working directory tree:
//! `<base>/<subjectId>/<subjectId>_<date.with.dots>/`, with one numbered
//! subdirectory per phase. The catalog is statically declared: the phase
//! list, order, dependency map, and which phase is repeatable never change
//! at runtime. `SessionFactory` turns the catalog plus the configured work
//! commands into a `Pipeline`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::errors::SchedulerError;
use crate::phase::{PhaseTask, WorkCommand};
use crate::pipeline::Pipeline;
use crate::scheduler::{PipelineFactory, RunRequest};

/// Fixed execution order of the phases. Control operations use this order
/// for prerequisite checks and for finding the first resumable phase.
pub const PHASE_ORDER: [&str; 5] = [
    "convert_raw",
    "segment",
    "bio_analysis",
    "movement_analysis",
    "create_report",
];

/// Static description of one catalog phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub subdir: &'static str,
    pub depends_on: &'static [&'static str],
    /// A repeatable phase returns to PENDING on success so it can be
    /// regenerated on demand; only the report phase is.
    pub repeatable: bool,
}

/// The five processing phases, in catalog order. The graph is a near-linear
/// chain with one branch: biosignal and movement analysis both follow
/// segmentation.
pub const PHASE_CATALOG: [PhaseSpec; 5] = [
    PhaseSpec {
        name: "convert_raw",
        subdir: "01_raw",
        depends_on: &[],
        repeatable: false,
    },
    PhaseSpec {
        name: "segment",
        subdir: "02_seg",
        depends_on: &["convert_raw"],
        repeatable: false,
    },
    PhaseSpec {
        name: "bio_analysis",
        subdir: "03_bio",
        depends_on: &["segment"],
        repeatable: false,
    },
    PhaseSpec {
        name: "movement_analysis",
        subdir: "04_mov",
        depends_on: &["segment"],
        repeatable: false,
    },
    PhaseSpec {
        name: "create_report",
        subdir: "05_rep",
        depends_on: &["movement_analysis"],
        repeatable: true,
    },
];

/// Look up a catalog phase by name.
pub fn phase_spec(name: &str) -> Option<&'static PhaseSpec> {
    PHASE_CATALOG.iter().find(|spec| spec.name == name)
}

/// Position of a phase in the fixed order.
pub fn phase_position(name: &str) -> Option<usize> {
    PHASE_ORDER.iter().position(|&n| n == name)
}

/// One subject + date processing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subject_id: String,
    /// Session date, `YYYY-MM-DD`
    pub date: String,
}

impl SessionRecord {
    /// Create a session record, validating the date format.
    pub fn new(subject_id: impl Into<String>, date: &str) -> Result<Self, SchedulerError> {
        NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| SchedulerError::InvalidDate {
            date: date.to_string(),
        })?;
        Ok(Self {
            subject_id: subject_id.into(),
            date: date.to_string(),
        })
    }

    /// Directory name of the session: `<id>_<date>` with the date's dashes
    /// replaced by dots, matching the on-disk layout the report tooling
    /// expects.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.subject_id, self.date.replace('-', "."))
    }

    /// Session root directory under the data base directory.
    pub fn root_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.subject_id).join(self.dir_name())
    }
}

/// Expand the placeholders a configured work command may carry.
fn expand_placeholders(
    template: &str,
    record: &SessionRecord,
    session_dir: &Path,
    work_dir: &Path,
    phase: &str,
) -> String {
    template
        .replace("{subject}", &record.subject_id)
        .replace("{date}", &record.date)
        .replace("{session_dir}", &session_dir.to_string_lossy())
        .replace("{work_dir}", &work_dir.to_string_lossy())
        .replace("{phase}", phase)
}

/// Default `PipelineFactory`: builds the full catalog pipeline for a
/// session, pre-creating the per-phase working directories and binding the
/// configured work commands.
pub struct SessionFactory {
    config: OrchestratorConfig,
}

impl SessionFactory {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// The configuration this factory builds from.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Root directory for a session under the configured base directory.
    pub fn session_root(&self, record: &SessionRecord) -> PathBuf {
        record.root_dir(&self.config.base_directory)
    }
}

impl PipelineFactory for SessionFactory {
    fn build(&self, subject_id: &str, request: &RunRequest) -> Result<Pipeline, SchedulerError> {
        let record = SessionRecord::new(subject_id, &request.date)?;
        let root = self.session_root(&record);

        let mut phases: HashMap<String, Arc<PhaseTask>> = HashMap::new();
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();

        for spec in &PHASE_CATALOG {
            let phase_config =
                self.config
                    .phases
                    .get(spec.name)
                    .ok_or_else(|| SchedulerError::MissingCommand {
                        phase: spec.name.to_string(),
                    })?;

            let work_dir = root.join(spec.subdir);
            std::fs::create_dir_all(&work_dir).map_err(|source| SchedulerError::SessionLayout {
                path: work_dir.clone(),
                source,
            })?;

            let argv: Vec<String> = phase_config
                .command
                .iter()
                .map(|arg| expand_placeholders(arg, &record, &root, &work_dir, spec.name))
                .collect();
            let (program, args) =
                argv.split_first()
                    .ok_or_else(|| SchedulerError::MissingCommand {
                        phase: spec.name.to_string(),
                    })?;

            let task = PhaseTask::new(
                spec.name,
                WorkCommand::new(program.clone(), args.iter().cloned()),
                &work_dir,
            )
            .with_repeatable(spec.repeatable)
            .with_poll_interval(self.config.poll_interval())
            .with_deadline(phase_config.deadline_secs.map(Duration::from_secs));

            phases.insert(spec.name.to_string(), Arc::new(task));
            dependencies.insert(
                spec.name.to_string(),
                spec.depends_on.iter().map(|d| d.to_string()).collect(),
            );
        }

        Ok(Pipeline::new(subject_id, phases, dependencies, root))
    }
}
