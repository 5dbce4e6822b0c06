//! Orchestrator configuration, read from a TOML file.
//!
//! # Configuration file format
//!
//! ```toml
//! base_directory = "patient_data"
//! poll_interval_ms = 500
//!
//! [phases.convert_raw]
//! command = ["python3", "-m", "tasks.convert", "--subject", "{subject}", "--date", "{date}", "--out", "{work_dir}"]
//!
//! [phases.segment]
//! command = ["python3", "-m", "tasks.segment", "--session", "{session_dir}"]
//! deadline_secs = 1800
//! ```
//!
//! Work commands may use the placeholders `{subject}`, `{date}`,
//! `{session_dir}`, `{work_dir}`, and `{phase}`. A phase with
//! `deadline_secs` set is terminated and recorded as ERROR when it exceeds
//! the deadline; without it a phase may run indefinitely.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::PHASE_CATALOG;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "biopipe.toml";

/// Per-phase work configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseConfig {
    /// Work command argv; the first element is the program.
    pub command: Vec<String>,
    /// Optional execution deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Root of the per-subject data tree.
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,
    /// Supervision poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Work configuration per catalog phase name.
    #[serde(default)]
    pub phases: HashMap<String, PhaseConfig>,
}

fn default_base_directory() -> PathBuf {
    PathBuf::from("patient_data")
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            poll_interval_ms: default_poll_interval_ms(),
            phases: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: OrchestratorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from the given path, or from `biopipe.toml` in the current
    /// directory, falling back to defaults when neither exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Verify that every catalog phase has a non-empty work command.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = PHASE_CATALOG
            .iter()
            .map(|spec| spec.name)
            .filter(|name| {
                self.phases
                    .get(*name)
                    .is_none_or(|phase| phase.command.is_empty())
            })
            .collect();
        if !missing.is_empty() {
            bail!("Missing work commands for phases: {missing:?}");
        }
        Ok(())
    }

    /// Supervision poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
