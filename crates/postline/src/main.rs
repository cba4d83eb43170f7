//! Postline: delayed-publish job scheduler
//!
//! Main binary with subcommands:
//! - `serve`: HTTP API plus the delay scheduler
//! - `jobs`: Dump jobs from a store file

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postline_scheduler::{
    DEFAULT_QUEUE_NAME, JobState, JobStore, RetryPolicy, SchedulerConfig, ServiceConfig,
};

mod daemon;

#[derive(Parser)]
#[command(name = "postline")]
#[command(about = "Delayed-publish job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the delay scheduler
    Serve(ServeArgs),

    /// Print jobs from a store as JSON lines
    Jobs {
        /// SQLite database file
        #[arg(long, env = "POSTLINE_DB", default_value = "postline.db")]
        db: PathBuf,

        /// Include completed, failed and cancelled jobs
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct ServeArgs {
    /// HTTP server port
    #[arg(long, env = "POSTLINE_PORT", default_value = "3001")]
    port: u16,

    /// SQLite database file
    #[arg(long, env = "POSTLINE_DB", default_value = "postline.db")]
    db: PathBuf,

    /// Queue name reported by the health endpoint
    #[arg(long, env = "POSTLINE_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    queue_name: String,

    /// Milliseconds between sweeps for due jobs
    #[arg(long, env = "POSTLINE_SWEEP_INTERVAL_MS", default_value = "1000")]
    sweep_interval_ms: u64,

    /// Timeout for a single webhook call in seconds
    #[arg(long, env = "POSTLINE_CALLBACK_TIMEOUT_SECS", default_value = "30")]
    callback_timeout_secs: u64,

    /// Attempts per job, including the first
    #[arg(long, env = "POSTLINE_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Delay before the first retry in seconds; doubles for each later one
    #[arg(long, env = "POSTLINE_RETRY_BASE_DELAY_SECS", default_value = "5")]
    retry_base_delay_secs: u64,

    /// Hours to keep finished jobs (0 keeps them forever)
    #[arg(long, env = "POSTLINE_RETENTION_HOURS", default_value = "168")]
    retention_hours: u64,
}

impl ServeArgs {
    fn service_config(&self) -> ServiceConfig {
        let retention = (self.retention_hours > 0)
            .then(|| Duration::from_secs(self.retention_hours.saturating_mul(3600)));

        ServiceConfig {
            queue_name: self.queue_name.clone(),
            scheduler: SchedulerConfig {
                sweep_interval: Duration::from_millis(self.sweep_interval_ms),
                retention,
                ..SchedulerConfig::default()
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_secs(self.retry_base_delay_secs),
            },
            callback_timeout: Duration::from_secs(self.callback_timeout_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "postline=info,postline_scheduler=info,postline_web=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.service_config();
            config.validate().into_diagnostic()?;
            daemon::run(args.port, args.db, config).await
        }

        Commands::Jobs { db, all } => print_jobs(db, all),
    }
}

fn print_jobs(db: PathBuf, all: bool) -> Result<()> {
    let store = JobStore::open(&db)
        .map_err(|e| miette::miette!("failed to open {}: {}", db.display(), e))?;
    let states = (!all).then_some(&JobState::PENDING[..]);

    for job in store.list(states).into_diagnostic()? {
        println!("{}", serde_json::to_string(&job).into_diagnostic()?);
    }

    store.close();
    Ok(())
}
