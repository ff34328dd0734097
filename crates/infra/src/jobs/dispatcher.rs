//! Dispatcher: hands eligible jobs to idle workers.
//!
//! Idle workers block on a [`WakeSignal`] with a bounded timeout instead of
//! spinning on the store. The signal is raised whenever new work may have
//! become claimable (submission, DLQ re-submission, retry scheduling) and on
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use queuectl_core::{Clock, SystemClock, WorkerId};

use super::store::{JobStore, JobStoreError};
use super::types::Job;

/// Condition-variable wake-up signal shared by the queue and its workers.
#[derive(Debug, Default)]
pub struct WakeSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current generation; pass it to [`wait`](Self::wait) to avoid missing
    /// a notification raised between observing the store and waiting.
    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    /// Wake every waiter.
    pub fn notify(&self) {
        let mut generation = self.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the generation moves past `seen`, `shutdown` is set, or
    /// `timeout` elapses. Returns `true` when woken by a notification.
    pub fn wait(&self, seen: u64, timeout: Duration, shutdown: &AtomicBool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.lock();

        while *generation == seen && !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            generation = match self.cond.wait_timeout(generation, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        *generation != seen
    }

    /// Sleep for `timeout` unless `shutdown` is set first. Notifications do
    /// not cut the pause short.
    pub fn pause(&self, timeout: Duration, shutdown: &AtomicBool) {
        let deadline = Instant::now() + timeout;
        let mut generation = self.lock();

        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            generation = match self.cond.wait_timeout(generation, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// Shared claim front-end for all workers of a pool.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    signal: Arc<WakeSignal>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("poll_interval", &self.poll_interval)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, signal: Arc<WakeSignal>, poll_interval: Duration) -> Self {
        Self {
            store,
            signal,
            clock: Arc::new(SystemClock),
            poll_interval,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn signal(&self) -> &Arc<WakeSignal> {
        &self.signal
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Block until a job is claimed and marked running for `worker_id`, or
    /// until `shutdown` is set (then `None`).
    pub fn acquire(&self, worker_id: &WorkerId, shutdown: &AtomicBool) -> Option<Job> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return None;
            }

            let seen = self.signal.generation();
            match self.store.claim_next(worker_id, self.clock.now()) {
                Ok(Some(job)) => {
                    if let Some(job) = self.start(worker_id, job, shutdown) {
                        return Some(job);
                    }
                }
                Ok(None) => {
                    self.signal.wait(seen, self.poll_interval, shutdown);
                }
                Err(err) => {
                    error!(worker_id = %worker_id, error = %err, "claim failed; backing off");
                    self.signal.pause(self.poll_interval, shutdown);
                }
            }
        }
    }

    /// `Claimed` → `Running` for a freshly claimed job.
    fn start(&self, worker_id: &WorkerId, job: Job, shutdown: &AtomicBool) -> Option<Job> {
        loop {
            match self.store.mark_running(&job.id) {
                Ok(running) => {
                    debug!(
                        worker_id = %worker_id,
                        job_id = %running.id,
                        attempt = running.attempt_count,
                        "job claimed"
                    );
                    return Some(running);
                }
                Err(JobStoreError::StoreUnavailable(reason)) => {
                    error!(worker_id = %worker_id, job_id = %job.id, error = %reason, "failed to start job; backing off");
                    if shutdown.load(Ordering::SeqCst) {
                        // Stays claimed by this worker until reconciled.
                        return None;
                    }
                    self.signal.pause(self.poll_interval, shutdown);
                }
                Err(err) => {
                    warn!(worker_id = %worker_id, job_id = %job.id, error = %err, "claimed job could not be started");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::{TimeZone, Utc};
    use queuectl_core::{JobId, ManualClock};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::store::contract::FlakyStore;
    use crate::jobs::types::{JobState, NewJob};

    fn worker() -> WorkerId {
        WorkerId::new("worker-0-test").unwrap()
    }

    fn setup() -> (Dispatcher, Arc<InMemoryJobStore>, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(WakeSignal::new()),
            Duration::from_millis(50),
        )
        .with_clock(clock.clone());
        (dispatcher, store, clock)
    }

    fn submit(store: &InMemoryJobStore, clock: &ManualClock, id: &str) {
        let job = NewJob::new(JobId::new(id).unwrap(), "true")
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();
    }

    #[test]
    fn acquire_marks_job_running() {
        let (dispatcher, store, clock) = setup();
        submit(&store, &clock, "a");

        let shutdown = AtomicBool::new(false);
        let job = dispatcher.acquire(&worker(), &shutdown).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.claimed_by, Some(worker()));
        assert_eq!(job.attempt_count, 1);
    }

    fn flaky_setup() -> (Dispatcher, Arc<FlakyStore<InMemoryJobStore>>, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(FlakyStore::new(InMemoryJobStore::with_clock(clock.clone())));
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(WakeSignal::new()),
            Duration::from_millis(20),
        )
        .with_clock(clock.clone());
        (dispatcher, store, clock)
    }

    #[test]
    fn claim_backs_off_while_store_unavailable() {
        let (dispatcher, store, clock) = flaky_setup();
        submit(&store.inner, &clock, "a");
        store.fail_claims(2);

        let shutdown = AtomicBool::new(false);
        let started = Instant::now();
        let job = dispatcher.acquire(&worker(), &shutdown).unwrap();

        assert_eq!(job.state, JobState::Running);
        assert_eq!(store.remaining_claim_failures(), 0);
        // One poll interval of back-off per failed claim
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn start_is_retried_while_store_unavailable() {
        let (dispatcher, store, clock) = flaky_setup();
        submit(&store.inner, &clock, "a");
        store.fail_starts(2);

        let shutdown = AtomicBool::new(false);
        let job = dispatcher.acquire(&worker(), &shutdown).unwrap();

        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn shutdown_during_start_back_off_leaves_job_claimed() {
        let (dispatcher, store, clock) = flaky_setup();
        submit(&store.inner, &clock, "a");
        store.fail_starts(u32::MAX);
        let shutdown = Arc::new(AtomicBool::new(false));

        let waiter = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || dispatcher.acquire(&worker(), &shutdown))
        };

        thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::SeqCst);
        dispatcher.signal().notify();

        assert!(waiter.join().unwrap().is_none());
        let job = store.get(&JobId::new("a").unwrap()).unwrap().unwrap();
        assert_eq!(job.state, JobState::Claimed);
        assert_eq!(job.claimed_by, Some(worker()));
    }

    #[test]
    fn acquire_returns_none_on_shutdown() {
        let (dispatcher, _store, _clock) = setup();
        let shutdown = AtomicBool::new(true);
        assert!(dispatcher.acquire(&worker(), &shutdown).is_none());
    }

    #[test]
    fn idle_worker_wakes_on_submission() {
        let (dispatcher, store, clock) = setup();
        let dispatcher = dispatcher.clone();
        let shutdown = Arc::new(AtomicBool::new(false));

        let waiter = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || dispatcher.acquire(&worker(), &shutdown))
        };

        thread::sleep(Duration::from_millis(20));
        submit(&store, &clock, "late");
        dispatcher.signal().notify();

        let job = waiter.join().unwrap().unwrap();
        assert_eq!(job.id.as_str(), "late");
    }

    #[test]
    fn shutdown_interrupts_idle_wait() {
        let (dispatcher, _store, _clock) = setup();
        let dispatcher = Dispatcher {
            poll_interval: Duration::from_secs(30),
            ..dispatcher
        };
        let shutdown = Arc::new(AtomicBool::new(false));

        let started = Instant::now();
        let waiter = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || dispatcher.acquire(&worker(), &shutdown))
        };

        thread::sleep(Duration::from_millis(20));
        shutdown.store(true, Ordering::SeqCst);
        dispatcher.signal().notify();

        assert!(waiter.join().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_reports_timeout_without_notification() {
        let signal = WakeSignal::new();
        let shutdown = AtomicBool::new(false);
        let seen = signal.generation();
        assert!(!signal.wait(seen, Duration::from_millis(10), &shutdown));

        signal.notify();
        assert!(signal.wait(seen, Duration::from_millis(10), &shutdown));
    }
}
