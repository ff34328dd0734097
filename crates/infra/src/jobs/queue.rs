//! Submission and status facade over a job store.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use queuectl_core::{Clock, DomainError, JobId, SystemClock, WorkerId};

use super::dispatcher::WakeSignal;
use super::dlq::DeadLetterQueue;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobState, JobStats, NewJob};

/// Submission error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid job: {0}")]
    InvalidJob(#[from] DomainError),
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for SubmitError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::DuplicateJob(id) => SubmitError::DuplicateJob(id),
            other => SubmitError::Store(other),
        }
    }
}

/// Entry point for producers and status readers.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    signal: Arc<WakeSignal>,
    clock: Arc<dyn Clock>,
    default_max_attempts: u32,
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(store: Arc<dyn JobStore>, signal: Arc<WakeSignal>) -> Self {
        Self {
            store,
            signal,
            clock: Arc::new(SystemClock),
            default_max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Validate and store a new job, then wake idle workers.
    pub fn submit(&self, new_job: NewJob) -> Result<Job, SubmitError> {
        let job = new_job.into_job(self.default_max_attempts, self.clock.now())?;
        let job = self.store.submit(job)?;

        info!(job_id = %job.id, max_attempts = job.max_attempts, "job submitted");
        self.signal.notify();
        Ok(job)
    }

    pub fn status(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats()
    }

    pub fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(state)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(id)
    }

    pub fn dlq(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(self.store.clone(), self.signal.clone())
    }

    /// Jobs currently claimed or running on one of `workers`.
    pub fn held_by(&self, workers: &[WorkerId]) -> Result<Vec<Job>, JobStoreError> {
        let workers: HashSet<&WorkerId> = workers.iter().collect();
        let mut held = self.store.list(None)?;
        held.retain(|job| {
            job.state.is_held()
                && job
                    .claimed_by
                    .as_ref()
                    .is_some_and(|owner| workers.contains(owner))
        });
        Ok(held)
    }

    /// Release every job still held by one of `workers`.
    ///
    /// Only for workers known to be gone (e.g. after a crash, or once the
    /// commands of a timed-out shutdown are confirmed stopped); a live worker
    /// would later fail to report its outcome.
    pub fn reconcile(&self, workers: &[WorkerId]) -> Result<Vec<Job>, JobStoreError> {
        let mut released = Vec::new();

        for job in self.held_by(workers)? {
            match self.store.release_orphan(&job.id) {
                Ok(job) => {
                    warn!(job_id = %job.id, state = %job.state, "released orphaned job");
                    released.push(job);
                }
                // Finished between listing and releasing.
                Err(JobStoreError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        if !released.is_empty() {
            self.signal.notify();
        }
        Ok(released)
    }
}
