//! Relay Worker
//!
//! Leases dispatch jobs from the SQLite queue and delivers them through the
//! messaging gateway.
//!
//! ## Commands
//!
//! - `run` (default): run the worker pool until SIGINT/SIGTERM
//! - `enqueue <job.json>`: add a job with the configured default options
//! - `status [job-id]`: print queue counts, or one job record
//! - `example-config`: print a commented configuration file

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tracing::{error, info};

use relay_common::NewJob;
use relay_config::{AppConfig, ConfigLoader, QueueConfig};
use relay_engine::{
    DispatchEngine, EngineConfig, HttpGateway, HttpGatewayConfig, PoolConfig, WorkerPool,
};
use relay_queue::{JobQueue, SqliteJobQueue};

#[derive(Parser, Debug)]
#[command(name = "relay-worker")]
#[command(about = "Relay dispatch worker - sends queued chat messages through the gateway")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool
    Run,
    /// Enqueue a job read from a JSON file
    Enqueue { file: PathBuf },
    /// Print queue counts, or one job when an id is given
    Status { job_id: Option<String> },
    /// Print an example configuration file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    relay_common::logging::init_logging("relay-worker");

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);

    if let Command::ExampleConfig = command {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    let loader = match args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("failed to load configuration")?;

    let queue = open_queue(&config.queue).await?;

    match command {
        Command::Run => run(config, queue).await,
        Command::Enqueue { file } => enqueue(&config, &*queue, file).await,
        Command::Status { job_id } => status(&*queue, job_id).await,
        Command::ExampleConfig => Ok(()),
    }
}

async fn open_queue(config: &QueueConfig) -> Result<Arc<SqliteJobQueue>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open queue database {}", config.database_url))?;

    let queue = SqliteJobQueue::new(pool, config.name.clone(), config.lease_timeout());
    queue.init_schema().await?;

    info!(
        queue = %config.name,
        database_url = %config.database_url,
        lease_timeout_secs = config.lease_timeout_secs,
        "Queue opened"
    );
    Ok(Arc::new(queue))
}

async fn run(config: AppConfig, queue: Arc<SqliteJobQueue>) -> Result<()> {
    config.validate()?;

    info!(queue = %config.queue.name, "Starting Relay worker");

    let gateway = HttpGateway::new(
        HttpGatewayConfig::new(&config.gateway.url, &config.gateway.api_key)
            .with_timeout(Duration::from_millis(config.gateway.timeout_ms)),
    )?;

    let engine = Arc::new(DispatchEngine::new(
        Arc::new(gateway),
        EngineConfig {
            api_call_delay: Duration::from_millis(config.worker.api_call_delay_ms),
            fail_when_all_units_fail: config.worker.fail_when_all_units_fail,
            rate_limit_per_minute: config.worker.rate_limit_per_minute.and_then(NonZeroU32::new),
        },
    ));

    let pool = WorkerPool::new(
        queue.clone(),
        engine,
        PoolConfig {
            concurrency: config.worker.concurrency,
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            poll_jitter: Duration::from_millis(config.worker.poll_jitter_ms),
            shutdown_grace: Duration::from_secs(config.worker.shutdown_grace_secs),
        },
    );
    let handle = pool.start();

    shutdown_signal().await;
    info!("Shutdown signal received...");

    handle.shutdown().await;
    queue.close().await;

    info!("Relay worker stopped");
    Ok(())
}

async fn enqueue(config: &AppConfig, queue: &dyn JobQueue, file: PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let job: NewJob = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a valid job", file.display()))?;

    let handle = queue.enqueue(job, config.queue.job.job_options()).await?;
    if handle.created {
        info!(job_id = %handle.id, "Job enqueued");
    } else {
        info!(job_id = %handle.id, "Job already exists");
    }

    println!("{}", serde_json::to_string_pretty(&handle)?);
    Ok(())
}

async fn status(queue: &dyn JobQueue, job_id: Option<String>) -> Result<()> {
    let output = match job_id {
        Some(id) => match queue.get_job(&id).await? {
            Some(record) => serde_json::to_value(record)?,
            None => bail!("job {} not found", id),
        },
        None => json!({
            "queue": queue.name(),
            "paused": queue.is_paused().await?,
            "counts": queue.counts().await?,
        }),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
