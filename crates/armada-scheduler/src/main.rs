//! Armada binary.
//!
//! Runs the scheduler or a worker, or cancels a job.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use armada_scheduler::{service, ArmadaConfig, SchedulerService, WorkerService};
use armada_state::JobId;

#[derive(Parser)]
#[command(name = "armada")]
#[command(about = "CPU-accounted cluster job scheduler")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to armada.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling loop, cache resync and reaper
    Scheduler,

    /// Run a worker that executes dispatched jobs
    Worker {
        /// CPUs to advertise (overrides configuration)
        #[arg(long)]
        cpus: Option<u32>,

        /// Parallel execution slots (overrides configuration)
        #[arg(long)]
        slots: Option<usize>,
    },

    /// Cancel a job
    Cancel {
        /// Job ID
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("armada_scheduler=info".parse()?)
                .add_directive("armada_state=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ArmadaConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Scheduler => {
            info!("armada scheduler starting");
            SchedulerService::new(config).run().await?;
        }
        Commands::Worker { cpus, slots } => {
            if let Some(cpus) = cpus {
                config.worker.cpus = cpus;
            }
            if let Some(slots) = slots {
                config.worker.slots = slots;
            }
            info!(cpus = config.worker.cpus, slots = config.worker.slots, "armada worker starting");
            WorkerService::new(config).run().await?;
        }
        Commands::Cancel { job_id } => {
            let outcome = service::cancel_job(&config, &JobId::new(job_id)).await?;
            println!("{outcome}");
        }
    }

    Ok(())
}
