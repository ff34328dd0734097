//! Dead letter queue: inspection and re-submission of `Dead` jobs.

use std::sync::Arc;

use tracing::info;

use queuectl_core::JobId;

use super::dispatcher::WakeSignal;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobState};

#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn JobStore>,
    signal: Arc<WakeSignal>,
}

impl core::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn JobStore>, signal: Arc<WakeSignal>) -> Self {
        Self { store, signal }
    }

    pub fn list_dead(&self) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(Some(JobState::Dead))
    }

    /// Put a dead job back in the queue with a fresh attempt budget.
    pub fn retry(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let job = self.store.resubmit_from_dlq(id)?;
        info!(job_id = %job.id, "dead job resubmitted");
        self.signal.notify();
        Ok(job)
    }
}
