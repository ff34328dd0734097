//! Job store boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use queuectl_core::{Clock, JobId, SystemClock, WorkerId};

use super::types::{Job, JobState, JobStats};

/// Job store abstraction.
///
/// The store is the only shared mutable resource of the engine. Every
/// state-changing call is an individually atomic conditional update;
/// `claim_next` is additionally atomic with respect to concurrent claimers.
pub trait JobStore: Send + Sync {
    /// Insert a new job as `Pending` with `attempt_count = 0`.
    fn submit(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Atomically claim the oldest eligible job for `worker_id`.
    ///
    /// Eligible means `Pending`/`RetryReady`, `next_attempt_at <= now` and
    /// attempts left. Ordered by `next_attempt_at`, then `created_at`.
    fn claim_next(&self, worker_id: &WorkerId, now: DateTime<Utc>)
    -> Result<Option<Job>, JobStoreError>;

    /// `Claimed` → `Running`.
    fn mark_running(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// `Running` → `Succeeded`.
    fn mark_succeeded(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// `Running` → `RetryReady`, eligible again at `next_attempt_at`.
    ///
    /// `next_attempt_at` never moves backwards for a given job. Rejected once
    /// `attempt_count` has reached `max_attempts`.
    fn mark_retry(
        &self,
        id: &JobId,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<Job, JobStoreError>;

    /// `Running` → `Dead`.
    fn mark_dead(&self, id: &JobId, last_error: &str) -> Result<Job, JobStoreError>;

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs in submission order, optionally filtered by state.
    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError>;

    /// `Dead` → fresh `Pending` (attempts reset, error cleared, same id).
    fn resubmit_from_dlq(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// Release a job held by a worker that is known to be gone.
    ///
    /// `Claimed`/`Running` → `RetryReady`, or `Dead` when the attempt that
    /// was in flight was the last one.
    fn release_orphan(&self, id: &JobId) -> Result<Job, JobStoreError>;

    /// Job counts per state.
    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.list(None)?;
        Ok(jobs.iter().collect())
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition for job {id}: {state} -> {target}")]
    InvalidTransition {
        id: JobId,
        state: JobState,
        target: JobState,
    },
    #[error("job {id} is not dead (state: {state})")]
    NotDead { id: JobId, state: JobState },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    /// Errors that indicate an environment problem rather than a protocol
    /// violation by the caller.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::StoreUnavailable(_))
    }
}

pub(crate) const ORPHAN_ERROR: &str = "worker stopped before reporting an outcome";

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

/// In-memory job store for tests, dev and single-process use.
///
/// Claims run under the write lock, which is what makes them exclusive.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::StoreUnavailable("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::StoreUnavailable("job store lock poisoned".to_string()))
    }

    /// Apply `update` if the job is currently in one of `from`.
    fn transition<P, F>(
        &self,
        id: &JobId,
        allowed: P,
        target: JobState,
        update: F,
    ) -> Result<Job, JobStoreError>
    where
        P: FnOnce(&Job) -> bool,
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        let mut inner = self.write()?;
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;

        if !allowed(&entry.job) {
            return Err(JobStoreError::InvalidTransition {
                id: id.clone(),
                state: entry.job.state,
                target,
            });
        }

        let now = self.clock.now();
        update(&mut entry.job, now);
        entry.job.updated_at = now;
        Ok(entry.job.clone())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn submit(&self, mut job: Job) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::DuplicateJob(job.id));
        }

        job.state = JobState::Pending;
        job.attempt_count = 0;
        job.claimed_by = None;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id.clone(),
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    fn claim_next(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        // Oldest eligible job by (next_attempt_at, created_at, insertion order)
        let next = inner
            .jobs
            .values()
            .filter(|e| e.job.is_eligible(now))
            .min_by_key(|e| (e.job.next_attempt_at, e.job.created_at, e.seq))
            .map(|e| e.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let updated_at = self.clock.now();
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        entry.job.state = JobState::Claimed;
        entry.job.claimed_by = Some(worker_id.clone());
        entry.job.attempt_count += 1;
        entry.job.updated_at = updated_at;
        Ok(Some(entry.job.clone()))
    }

    fn mark_running(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.transition(id, |job| job.state == JobState::Claimed, JobState::Running, |job, _| {
            job.state = JobState::Running;
        })
    }

    fn mark_succeeded(&self, id: &JobId) -> Result<Job, JobStoreError> {
        self.transition(id, |job| job.state == JobState::Running, JobState::Succeeded, |job, _| {
            job.state = JobState::Succeeded;
            job.claimed_by = None;
        })
    }

    fn mark_retry(
        &self,
        id: &JobId,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<Job, JobStoreError> {
        // Exhausted jobs go to Dead, never back to RetryReady.
        let retryable = |job: &Job| {
            job.state == JobState::Running && job.attempt_count < job.max_attempts
        };
        self.transition(id, retryable, JobState::RetryReady, |job, _| {
            job.state = JobState::RetryReady;
            job.claimed_by = None;
            job.next_attempt_at = job.next_attempt_at.max(next_attempt_at);
            job.last_error = Some(last_error.to_string());
        })
    }

    fn mark_dead(&self, id: &JobId, last_error: &str) -> Result<Job, JobStoreError> {
        self.transition(id, |job| job.state == JobState::Running, JobState::Dead, |job, _| {
            job.state = JobState::Dead;
            job.claimed_by = None;
            job.last_error = Some(last_error.to_string());
        })
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.read()?;
        Ok(inner.jobs.get(id).map(|e| e.job.clone()))
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut entries: Vec<_> = inner
            .jobs
            .values()
            .filter(|e| state.is_none_or(|s| e.job.state == s))
            .collect();

        entries.sort_by_key(|e| (e.job.created_at, e.seq));
        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }

    fn resubmit_from_dlq(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;

        if entry.job.state != JobState::Dead {
            return Err(JobStoreError::NotDead {
                id: id.clone(),
                state: entry.job.state,
            });
        }

        let now = self.clock.now();
        let job = &mut entry.job;
        job.state = JobState::Pending;
        job.attempt_count = 0;
        job.last_error = None;
        job.claimed_by = None;
        job.next_attempt_at = now;
        job.updated_at = now;
        Ok(job.clone())
    }

    fn release_orphan(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;

        if !entry.job.state.is_held() {
            return Err(JobStoreError::InvalidTransition {
                id: id.clone(),
                state: entry.job.state,
                target: JobState::RetryReady,
            });
        }

        let now = self.clock.now();
        let job = &mut entry.job;
        job.claimed_by = None;
        job.last_error = Some(ORPHAN_ERROR.to_string());
        job.updated_at = now;
        if job.attempts_exhausted() {
            job.state = JobState::Dead;
        } else {
            job.state = JobState::RetryReady;
            job.next_attempt_at = job.next_attempt_at.max(now);
        }
        Ok(job.clone())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        Ok(inner.jobs.values().map(|e| &e.job).collect())
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn submit(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).submit(job)
    }

    fn claim_next(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(worker_id, now)
    }

    fn mark_running(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).mark_running(id)
    }

    fn mark_succeeded(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).mark_succeeded(id)
    }

    fn mark_retry(
        &self,
        id: &JobId,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<Job, JobStoreError> {
        (**self).mark_retry(id, next_attempt_at, last_error)
    }

    fn mark_dead(&self, id: &JobId, last_error: &str) -> Result<Job, JobStoreError> {
        (**self).mark_dead(id, last_error)
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(state)
    }

    fn resubmit_from_dlq(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).resubmit_from_dlq(id)
    }

    fn release_orphan(&self, id: &JobId) -> Result<Job, JobStoreError> {
        (**self).release_orphan(id)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use proptest::prelude::*;
    use queuectl_core::ManualClock;

    use super::contract::*;
    use super::*;

    fn setup() -> (InMemoryJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        (InMemoryJobStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn submit_rejects_duplicate_ids() {
        let (store, clock) = setup();
        submit_rejects_duplicates(&store, &clock);
    }

    #[test]
    fn enqueue_and_claim() {
        let (store, clock) = setup();
        claim_sets_owner_and_counts_attempt(&store, &clock);
    }

    #[test]
    fn claim_order_is_fifo() {
        let (store, clock) = setup();
        claim_is_fifo(&store, &clock);
    }

    #[test]
    fn claim_waits_for_schedule() {
        let (store, clock) = setup();
        claim_respects_next_attempt_at(&store, &clock);
    }

    #[test]
    fn guarded_transitions() {
        let (store, clock) = setup();
        transitions_are_guarded(&store, &clock);
    }

    #[test]
    fn double_dead_is_rejected() {
        let (store, clock) = setup();
        mark_dead_twice_is_rejected(&store, &clock);
    }

    #[test]
    fn retry_schedule_is_monotonic() {
        let (store, clock) = setup();
        retry_never_moves_backwards(&store, &clock);
    }

    #[test]
    fn attempt_ceiling_forces_dead() {
        let (store, clock) = setup();
        exhausted_jobs_cannot_be_retried(&store, &clock);
    }

    #[test]
    fn dead_letter_flow() {
        let (store, clock) = setup();
        dlq_round_trip(&store, &clock);
    }

    #[test]
    fn orphan_release() {
        let (store, clock) = setup();
        release_orphan_requeues_or_buries(&store, &clock);
    }

    #[test]
    fn stats_tracking() {
        let (store, clock) = setup();
        list_and_stats(&store, &clock);
    }

    #[test]
    fn two_workers_one_job() {
        let (store, clock) = setup();
        let store = Arc::new(store);
        store.submit(new_job("only", 3, clock.now())).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let now = clock.now();
        let handles: Vec<_> = (0..2)
            .map(|n| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.claim_next(&worker(n), now).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// N concurrent claimers against M eligible jobs: M claims total, none twice.
        #[test]
        fn concurrent_claims_never_duplicate(workers in 2usize..8, jobs in 0usize..40) {
            let (store, clock) = setup();
            concurrent_claims_are_exclusive(Arc::new(store), &clock, workers, jobs);
        }
    }
}
