//! Worker daemon: runs the job pool until Ctrl-C, then shuts down gracefully.
//!
//! Configuration is read from `QUEUECTL_CONFIG` (default
//! `~/.queuectl/config.json`); `QUEUECTL_WORKERS` and `QUEUECTL_DB` override
//! the file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use queuectl_infra::config::EngineConfig;
use queuectl_infra::jobs::{
    Dispatcher, JobQueue, JobStore, PoolError, ShellCommandRunner, SqliteJobStore, WakeSignal,
    WorkerPool,
};

const CONFIG_ENV: &str = "QUEUECTL_CONFIG";

fn main() -> ExitCode {
    queuectl_observability::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "queuectl worker failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(EngineConfig::default_path);
    let mut config = EngineConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config
        .apply_env()
        .context("invalid environment override")?;

    let db_path = config.database_path();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&db_path)?);
    let signal = Arc::new(WakeSignal::new());
    let queue = JobQueue::new(store.clone(), signal.clone())
        .with_default_max_attempts(config.max_attempts);

    let stats = queue.status().context("failed to read queue status")?;
    info!(
        database = %db_path.display(),
        pending = stats.pending,
        retry_ready = stats.retry_ready,
        dead = stats.dead,
        "job store opened"
    );

    let dispatcher = Dispatcher::new(store, signal, config.poll_interval());
    let mut pool = WorkerPool::new(dispatcher, Arc::new(ShellCommandRunner), config.pool_config());
    let workers = pool.start(config.worker_count)?;
    info!(workers = workers.len(), "waiting for jobs; press Ctrl-C to stop");

    wait_for_ctrl_c()?;
    info!("shutdown requested");

    match pool.stop() {
        Ok(()) => Ok(()),
        Err(PoolError::ShutdownTimeout { workers }) => {
            // Their commands may still be running; leave the jobs held until an
            // operator confirms they stopped and runs reconcile.
            let held = queue
                .held_by(&workers)
                .context("failed to list jobs of unfinished workers")?;
            for job in &held {
                error!(
                    job_id = %job.id,
                    worker_id = ?job.claimed_by.as_ref().map(|w| w.to_string()),
                    state = %job.state,
                    "job still held by unfinished worker"
                );
            }
            let workers: Vec<String> = workers.iter().map(ToString::to_string).collect();
            anyhow::bail!(
                "shutdown timed out with {} job(s) held by workers [{}]",
                held.len(),
                workers.join(", ")
            )
        }
        Err(err) => Err(err.into()),
    }
}

fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")
}
