// Dispatcher CLI: drains the work-item queue, bounded or continuous.
//
// Exit codes: 0 normal, 2 partial (some items retried or deferred), 3 fatal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tillbridge_core::kernel::handlers::register_handlers;
use tillbridge_core::kernel::jobs::{Dispatcher, DispatcherConfig, JobRegistry, JobType};
use tillbridge_core::kernel::ServerDeps;
use tillbridge_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "runner", about = "Drain the vendor work-item queue")]
struct Args {
    /// Stop after processing this many jobs (bounded mode).
    #[arg(long)]
    limit: Option<u64>,

    /// Restrict to a single job type.
    #[arg(long = "type")]
    job_type: Option<String>,

    /// Run indefinitely with idle backoff.
    #[arg(long, conflicts_with = "no_continuous")]
    continuous: bool,

    /// Force bounded mode.
    #[arg(long)]
    no_continuous: bool,

    /// Wall-clock budget in seconds (bounded mode).
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tillbridge_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(e) => {
            tracing::error!(error = %e, "runner failed");
            std::process::exit(3);
        }
    }
}

async fn run(args: Args) -> Result<tillbridge_core::kernel::jobs::RunOutcome> {
    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let deps = Arc::new(ServerDeps::new(pool, &config)?);

    let job_type = match &args.job_type {
        Some(raw) => Some(
            JobType::parse(raw)
                .with_context(|| format!("unknown job type: {}", raw))?,
        ),
        None => None,
    };

    let mut registry = JobRegistry::new();
    register_handlers(&mut registry);

    let config = DispatcherConfig {
        limit: args.limit,
        job_type,
        continuous: args.continuous && !args.no_continuous,
        time_budget: args.timeout.map(Duration::from_secs),
        ..Default::default()
    };

    let dispatcher = Dispatcher::new(deps, Arc::new(registry), config);
    dispatcher.install_signal_handlers();
    dispatcher.run().await
}
