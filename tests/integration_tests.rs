//! Integration tests for biopipe
//!
//! These exercise the orchestration core end to end: scheduling, FIFO
//! queueing, resumption, crash recovery, and the CLI surface.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use biopipe::config::{OrchestratorConfig, PhaseConfig};
use biopipe::control::PipelineService;
use biopipe::phase::{PhaseRecord, PhaseStatus};
use biopipe::pipeline::read_summary;
use biopipe::scheduler::{Ack, RunRequest};
use biopipe::session::PHASE_CATALOG;

const DATE: &str = "2026-01-15";

/// Helper to create a biopipe Command
fn biopipe() -> Command {
    cargo_bin_cmd!("biopipe")
}

/// Build a service whose phases all run the given shell script.
fn shell_service(base: &Path, script: &str) -> PipelineService {
    let mut config = OrchestratorConfig {
        base_directory: base.to_path_buf(),
        poll_interval_ms: 20,
        ..Default::default()
    };
    for spec in &PHASE_CATALOG {
        config.phases.insert(
            spec.name.to_string(),
            PhaseConfig {
                command: vec!["sh".into(), "-c".into(), script.into()],
                deadline_secs: None,
            },
        );
    }
    PipelineService::new(config)
}

fn session_root(base: &Path, subject: &str) -> std::path::PathBuf {
    base.join(subject).join(format!("{subject}_2026.01.15"))
}

fn write_status(base: &Path, subject: &str, name: &str, status: PhaseStatus) {
    let spec = PHASE_CATALOG.iter().find(|s| s.name == name).unwrap();
    let dir = session_root(base, subject).join(spec.subdir);
    fs::create_dir_all(&dir).unwrap();
    let record = PhaseRecord {
        name: name.to_string(),
        status,
        timestamp: 1.0,
    };
    fs::write(
        dir.join(format!("{name}.json")),
        serde_json::to_string(&record).unwrap(),
    )
    .unwrap();
}

fn read_status(base: &Path, subject: &str, name: &str) -> PhaseStatus {
    let spec = PHASE_CATALOG.iter().find(|s| s.name == name).unwrap();
    let path = session_root(base, subject)
        .join(spec.subdir)
        .join(format!("{name}.json"));
    let record: PhaseRecord = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    record.status
}

async fn wait_idle(service: &PipelineService) {
    for _ in 0..500 {
        if service.scheduler().is_idle() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scheduler did not drain");
}

// =============================================================================
// Orchestration core
// =============================================================================

mod orchestration {
    use super::*;

    #[tokio::test]
    async fn full_run_persists_every_phase_and_the_summary() {
        let dir = TempDir::new().unwrap();
        let svc = shell_service(dir.path(), "true");

        let ack = svc.execute("P001", RunRequest::full(DATE)).unwrap();
        assert!(matches!(ack, Ack::Started { .. }));
        wait_idle(&svc).await;

        for spec in &PHASE_CATALOG {
            let status = read_status(dir.path(), "P001", spec.name);
            // The report phase is repeatable: success returns it to PENDING
            let expected = if spec.repeatable {
                PhaseStatus::Pending
            } else {
                PhaseStatus::Success
            };
            assert_eq!(status, expected, "{}", spec.name);
        }

        let summary = read_summary(&session_root(dir.path(), "P001"))
            .unwrap()
            .unwrap();
        assert_eq!(summary.len(), PHASE_CATALOG.len());
        assert_eq!(summary["segment"], "SUCCESS");
        assert_eq!(summary["create_report"], "PENDING");
    }

    #[tokio::test]
    async fn three_subjects_queue_fifo_and_all_complete() {
        let dir = TempDir::new().unwrap();
        let svc = shell_service(dir.path(), "sleep 0.05");

        let acks = [
            svc.execute("P001", RunRequest::full(DATE)).unwrap(),
            svc.execute("P002", RunRequest::full(DATE)).unwrap(),
            svc.execute("P003", RunRequest::full(DATE)).unwrap(),
        ];
        assert!(matches!(
            acks[0],
            Ack::Started { ref subject } if subject == "P001"
        ));
        assert_eq!(
            acks[1],
            Ack::Queued {
                subject: "P002".into(),
                position: 1
            }
        );
        assert_eq!(
            acks[2],
            Ack::Queued {
                subject: "P003".into(),
                position: 2
            }
        );

        wait_idle(&svc).await;
        for subject in ["P001", "P002", "P003"] {
            assert_eq!(
                read_status(dir.path(), subject, "segment"),
                PhaseStatus::Success,
                "{subject}"
            );
        }
    }

    #[tokio::test]
    async fn only_one_pipeline_runs_at_a_time() {
        let dir = TempDir::new().unwrap();
        let svc = shell_service(dir.path(), "sleep 0.3");

        svc.execute("P001", RunRequest::full(DATE)).unwrap();
        svc.execute("P002", RunRequest::full(DATE)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(svc.scheduler().active_job().as_deref(), Some("P001"));
        let queued = svc.scheduler().registered("P002").unwrap();
        assert!(
            queued.statuses().values().all(|s| !s.is_running()),
            "queued pipeline must not have running phases"
        );

        svc.stop("P001", DATE).unwrap();
        svc.stop("P002", DATE).unwrap();
        wait_idle(&svc).await;
    }

    #[tokio::test]
    async fn rerunning_a_finished_subject_skips_all_work() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("invocations");
        let svc = shell_service(
            dir.path(),
            &format!("echo x >> {}", counter.display()),
        );

        svc.execute("P001", RunRequest::full(DATE)).unwrap();
        wait_idle(&svc).await;
        let first = fs::read_to_string(&counter).unwrap().lines().count();
        // Four analysis phases plus the repeatable report phase
        assert_eq!(first, 5);

        svc.execute("P001", RunRequest::full(DATE)).unwrap();
        wait_idle(&svc).await;
        let second = fs::read_to_string(&counter).unwrap().lines().count();
        // Only the repeatable report phase runs again
        assert_eq!(second, 6);
    }

    #[tokio::test]
    async fn stop_then_continue_resumes_from_the_cancelled_phase() {
        let dir = TempDir::new().unwrap();
        // Statuses left behind by a stopped run
        write_status(dir.path(), "P001", "convert_raw", PhaseStatus::Success);
        write_status(dir.path(), "P001", "segment", PhaseStatus::Success);
        write_status(dir.path(), "P001", "bio_analysis", PhaseStatus::Cancelled);
        write_status(dir.path(), "P001", "movement_analysis", PhaseStatus::Pending);

        let svc = shell_service(dir.path(), "true");
        let ack = svc.resume("P001", DATE).unwrap();
        assert!(matches!(ack, Ack::Started { .. }));
        wait_idle(&svc).await;

        assert_eq!(
            read_status(dir.path(), "P001", "bio_analysis"),
            PhaseStatus::Success
        );
        assert_eq!(
            read_status(dir.path(), "P001", "movement_analysis"),
            PhaseStatus::Success
        );
    }

    #[tokio::test]
    async fn orphaned_running_phase_is_recovered_by_continue() {
        let dir = TempDir::new().unwrap();
        write_status(dir.path(), "P001", "convert_raw", PhaseStatus::Success);
        write_status(dir.path(), "P001", "segment", PhaseStatus::Running);

        let svc = shell_service(dir.path(), "true");
        assert!(!svc.scheduler().is_busy());

        let ack = svc.resume("P001", DATE).unwrap();
        assert!(matches!(ack, Ack::Started { .. }));
        wait_idle(&svc).await;

        assert_eq!(
            read_status(dir.path(), "P001", "segment"),
            PhaseStatus::Success
        );
    }

    #[tokio::test]
    async fn stop_from_a_second_service_cancels_the_running_phase() {
        let dir = TempDir::new().unwrap();
        let svc = shell_service(dir.path(), "sleep 30");

        svc.execute("P001", RunRequest::full(DATE)).unwrap();
        let status_path = session_root(dir.path(), "P001")
            .join("01_raw")
            .join("convert_raw.json");
        for _ in 0..200 {
            if let Ok(content) = fs::read_to_string(&status_path)
                && let Ok(record) = serde_json::from_str::<PhaseRecord>(&content)
                && record.status.is_running()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(read_status(dir.path(), "P001", "convert_raw"), PhaseStatus::Running);

        // A second service knows nothing about the run except the disk
        let other = shell_service(dir.path(), "sleep 30");
        let ack = other.stop("P001", DATE).unwrap();
        assert_eq!(
            ack,
            Ack::Stopped {
                subject: "P001".into()
            }
        );

        wait_idle(&svc).await;
        assert_eq!(
            read_status(dir.path(), "P001", "convert_raw"),
            PhaseStatus::Cancelled
        );
        assert_eq!(
            other.stop("P001", DATE).unwrap(),
            Ack::NothingToStop {
                subject: "P001".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_phase_halts_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let svc = shell_service(dir.path(), "exit 1");

        svc.execute("P001", RunRequest::full(DATE)).unwrap();
        wait_idle(&svc).await;

        assert_eq!(
            read_status(dir.path(), "P001", "convert_raw"),
            PhaseStatus::Error
        );
        // Downstream phases never started, so no record was written
        let seg_file = session_root(dir.path(), "P001")
            .join("02_seg")
            .join("segment.json");
        assert!(!seg_file.exists());
    }
}

// =============================================================================
// CLI surface
// =============================================================================

mod cli {
    use super::*;

    fn write_shell_config(dir: &TempDir) -> std::path::PathBuf {
        let base = dir.path().join("data");
        let mut toml = format!("base_directory = \"{}\"\npoll_interval_ms = 20\n", base.display());
        for spec in &PHASE_CATALOG {
            toml.push_str(&format!(
                "[phases.{}]\ncommand = [\"sh\", \"-c\", \"true\"]\n",
                spec.name
            ));
        }
        let path = dir.path().join("biopipe.toml");
        fs::write(&path, toml).unwrap();
        path
    }

    #[test]
    fn help_and_version() {
        biopipe().arg("--help").assert().success();
        biopipe().arg("--version").assert().success();
    }

    #[test]
    fn run_refuses_without_phase_commands() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("biopipe.toml");
        fs::write(&config, "poll_interval_ms = 20\n").unwrap();

        biopipe()
            .args(["--config", config.to_str().unwrap()])
            .args(["run", "P001", "--date", DATE])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Missing work commands"));
    }

    #[test]
    fn run_executes_the_full_pipeline() {
        let dir = TempDir::new().unwrap();
        let config = write_shell_config(&dir);

        biopipe()
            .args(["--config", config.to_str().unwrap()])
            .args(["run", "P001", "--date", DATE])
            .assert()
            .success()
            .stdout(predicate::str::contains("started immediately"));

        let base = dir.path().join("data");
        assert_eq!(
            read_status(&base, "P001", "movement_analysis"),
            PhaseStatus::Success
        );
    }

    #[test]
    fn run_rejects_a_malformed_date() {
        let dir = TempDir::new().unwrap();
        let config = write_shell_config(&dir);

        biopipe()
            .args(["--config", config.to_str().unwrap()])
            .args(["run", "P001", "--date", "15-01-2026"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid session date"));
    }

    #[test]
    fn status_reports_persisted_phases() {
        let dir = TempDir::new().unwrap();
        let config = write_shell_config(&dir);
        let base = dir.path().join("data");
        write_status(&base, "P001", "convert_raw", PhaseStatus::Success);
        write_status(&base, "P001", "segment", PhaseStatus::Cancelled);

        biopipe()
            .args(["--config", config.to_str().unwrap()])
            .args(["status", "P001", "--date", DATE])
            .assert()
            .success()
            .stdout(predicate::str::contains("SUCCESS"))
            .stdout(predicate::str::contains("CANCELLED"));
    }

    #[test]
    fn status_without_session_directory() {
        let dir = TempDir::new().unwrap();
        let config = write_shell_config(&dir);

        biopipe()
            .args(["--config", config.to_str().unwrap()])
            .args(["status", "P404", "--date", DATE])
            .assert()
            .success()
            .stdout(predicate::str::contains("No session directory"));
    }
}
