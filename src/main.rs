use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use biopipe::config::OrchestratorConfig;
use biopipe::control::PipelineService;
use biopipe::pipeline::read_summary;
use biopipe::scheduler::RunRequest;
use biopipe::session::{PHASE_CATALOG, SessionRecord};

#[derive(Parser)]
#[command(name = "biopipe")]
#[command(version, about = "Pipeline orchestrator for patient recordings")]
struct Cli {
    /// Path to the configuration file (default: ./biopipe.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the processing pipeline for a subject session, or a single
    /// phase of it, and wait for the scheduler to drain
    Run {
        subject: String,
        #[arg(long)]
        date: String,
        /// Target a single phase instead of the full pipeline
        #[arg(long)]
        phase: Option<String>,
    },
    /// Cancel the running phases of a subject's pipeline, including a run
    /// owned by another process
    Stop {
        subject: String,
        #[arg(long)]
        date: String,
    },
    /// Resume a cancelled pipeline from its first cancelled phase
    #[command(name = "continue")]
    Continue {
        subject: String,
        #[arg(long)]
        date: String,
    },
    /// Show the persisted phase statuses for a subject session
    Status {
        subject: String,
        #[arg(long)]
        date: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            subject,
            date,
            phase,
        } => {
            config.validate()?;
            let service = PipelineService::new(config);
            let request = match phase {
                Some(phase) => RunRequest::for_phase(date, phase),
                None => RunRequest::full(date),
            };
            let ack = service.execute(&subject, request)?;
            println!("{ack}");
            wait_for_drain(&service).await;
        }
        Commands::Stop { subject, date } => {
            config.validate()?;
            let service = PipelineService::new(config);
            let ack = service.stop(&subject, &date)?;
            println!("{ack}");
        }
        Commands::Continue { subject, date } => {
            config.validate()?;
            let service = PipelineService::new(config);
            let ack = service.resume(&subject, &date)?;
            println!("{ack}");
            wait_for_drain(&service).await;
        }
        Commands::Status { subject, date } => {
            print_status(&config, &subject, &date)?;
        }
    }

    Ok(())
}

/// Block until the scheduler has no active or queued work, so a CLI `run`
/// returns only after its pipeline (and anything queued behind it) is done.
async fn wait_for_drain(service: &PipelineService) {
    while !service.scheduler().is_idle() {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

fn print_status(config: &OrchestratorConfig, subject: &str, date: &str) -> Result<()> {
    let record = SessionRecord::new(subject, date)?;
    let root = record.root_dir(&config.base_directory);
    if !root.exists() {
        println!("No session directory at {}", root.display());
        return Ok(());
    }

    for spec in &PHASE_CATALOG {
        let path = root.join(spec.subdir).join(format!("{}.json", spec.name));
        let status = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let record: biopipe::phase::PhaseRecord = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            record.status.to_string()
        } else {
            "PENDING".to_string()
        };
        println!("{:<20} {status}", spec.name);
    }

    if let Some(summary) = read_summary(&root)? {
        println!("\nLast pipeline summary:");
        for (name, status) in summary {
            println!("{name:<20} {status}");
        }
    }
    Ok(())
}
