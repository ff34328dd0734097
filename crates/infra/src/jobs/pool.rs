//! Worker pool: owns worker threads, starts them and shuts them down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use queuectl_core::WorkerId;

use super::command::CommandRunner;
use super::dispatcher::Dispatcher;
use super::retry::RetryPolicy;
use super::worker::Worker;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub retry_policy: RetryPolicy,
    /// Per-attempt limit; `None` lets commands run indefinitely
    pub execution_timeout: Option<Duration>,
    /// How long `stop` waits for in-flight jobs
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            execution_timeout: Some(Duration::from_secs(300)),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("shutdown timed out; workers still running: {}", format_ids(.workers))]
    ShutdownTimeout { workers: Vec<WorkerId> },
}

fn format_ids(ids: &[WorkerId]) -> String {
    ids.iter().map(WorkerId::as_str).collect::<Vec<_>>().join(", ")
}

/// Reports a worker's exit, including exit by panic.
struct ExitNotice {
    id: WorkerId,
    done: mpsc::Sender<WorkerId>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.done.send(self.id.clone());
    }
}

#[derive(Debug)]
struct WorkerHandle {
    id: WorkerId,
    join: Option<thread::JoinHandle<()>>,
}

#[derive(Debug)]
struct Running {
    shutdown: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    done: mpsc::Receiver<WorkerId>,
}

/// Pool of worker threads sharing one dispatcher.
pub struct WorkerPool {
    dispatcher: Dispatcher,
    runner: Arc<dyn CommandRunner>,
    config: PoolConfig,
    running: Option<Running>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("workers", &self.worker_ids())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(dispatcher: Dispatcher, runner: Arc<dyn CommandRunner>, config: PoolConfig) -> Self {
        Self {
            dispatcher,
            runner,
            config,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Ids of the workers started by the last `start`.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.running
            .as_ref()
            .map(|r| r.workers.iter().map(|w| w.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Spawn `count` workers.
    pub fn start(&mut self, count: usize) -> Result<Vec<WorkerId>, PoolError> {
        if self.running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }
        if count == 0 {
            return Err(PoolError::InvalidWorkerCount);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<WorkerId>();
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let id = WorkerId::generate(index);
            let worker = Worker::new(
                id.clone(),
                self.dispatcher.clone(),
                self.runner.clone(),
                self.config.retry_policy,
                self.config.execution_timeout,
            );
            let notice = ExitNotice {
                id: id.clone(),
                done: done_tx.clone(),
            };
            let flag = shutdown.clone();

            let spawned = thread::Builder::new()
                .name(id.to_string())
                .spawn(move || {
                    let _notice = notice;
                    worker.run(&flag);
                });

            match spawned {
                Ok(join) => workers.push(WorkerHandle {
                    id,
                    join: Some(join),
                }),
                Err(err) => {
                    // Unwind the workers already started before reporting.
                    let partial = Running {
                        shutdown,
                        workers,
                        done: done_rx,
                    };
                    self.running = Some(partial);
                    let _ = self.stop();
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        info!(workers = count, "worker pool started");
        let ids = workers.iter().map(|w| w.id.clone()).collect();
        self.running = Some(Running {
            shutdown,
            workers,
            done: done_rx,
        });
        Ok(ids)
    }

    /// Signal shutdown and wait for every worker to finish its current job.
    ///
    /// Waits at most `shutdown_timeout`; workers still busy after that are
    /// left running and reported in [`PoolError::ShutdownTimeout`]. Stopping
    /// a pool that is not running is a no-op.
    pub fn stop(&mut self) -> Result<(), PoolError> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        info!(workers = running.workers.len(), "stopping worker pool");
        running.shutdown.store(true, Ordering::SeqCst);
        self.dispatcher.signal().notify();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut remaining = running.workers.len();
        while remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match running.done.recv_timeout(deadline - now) {
                Ok(id) => {
                    remaining -= 1;
                    if let Some(handle) = running.workers.iter_mut().find(|w| w.id == id) {
                        if let Some(join) = handle.join.take() {
                            let _ = join.join();
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let stuck: Vec<WorkerId> = running
            .workers
            .iter()
            .filter(|w| w.join.is_some())
            .map(|w| w.id.clone())
            .collect();

        if stuck.is_empty() {
            info!("worker pool stopped");
            Ok(())
        } else {
            error!(workers = %format_ids(&stuck), "worker pool shutdown timed out");
            Err(PoolError::ShutdownTimeout { workers: stuck })
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.store(true, Ordering::SeqCst);
            self.dispatcher.signal().notify();
        }
    }
}
