//! A single worker: acquire → execute → report, until shutdown.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use queuectl_core::{Clock, WorkerId};

use super::command::{CommandRunner, bounded};
use super::dispatcher::Dispatcher;
use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStoreError;
use super::types::{Job, JobOutcome};

/// Store writes of an outcome are retried this many times before giving up.
const REPORT_ATTEMPTS: u32 = 5;

/// One worker execution context.
pub struct Worker {
    id: WorkerId,
    dispatcher: Dispatcher,
    runner: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
    execution_timeout: Option<Duration>,
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("execution_timeout", &self.execution_timeout)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        dispatcher: Dispatcher,
        runner: Arc<dyn CommandRunner>,
        policy: RetryPolicy,
        execution_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            dispatcher,
            runner,
            policy,
            execution_timeout,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Main loop. Returns once `shutdown` is observed between jobs; a job in
    /// progress always runs to completion and is reported first.
    pub fn run(&self, shutdown: &AtomicBool) {
        info!(worker_id = %self.id, "worker started");
        while let Some(job) = self.dispatcher.acquire(&self.id, shutdown) {
            self.process(&job);
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Execute a running job and record the outcome.
    pub fn process(&self, job: &Job) {
        let outcome = self.execute(job);
        if let Err(err) = self.report(job, &outcome) {
            error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %err,
                "failed to record job outcome; job stays running until reconciled"
            );
        }
    }

    /// Run the job's command and classify the result.
    pub fn execute(&self, job: &Job) -> JobOutcome {
        debug!(worker_id = %self.id, job_id = %job.id, attempt = job.attempt_count, "executing job");

        match self.runner.run(&job.command, self.execution_timeout) {
            Ok(output) if output.success() => JobOutcome::Success,
            Ok(output) => JobOutcome::failure(output.failure_message()),
            Err(err) => JobOutcome::failure(bounded(&err.to_string())),
        }
    }

    /// Feed the outcome through the retry policy and apply the decision.
    pub fn report(&self, job: &Job, outcome: &JobOutcome) -> Result<Job, JobStoreError> {
        let now = self.dispatcher.clock().now();
        let decision = self
            .policy
            .decide(job.attempt_count, job.max_attempts, outcome, now);

        let updated = self.apply(job, &decision)?;

        match &decision {
            RetryDecision::Succeed => {
                info!(worker_id = %self.id, job_id = %job.id, attempt = job.attempt_count, "job succeeded");
            }
            RetryDecision::Retry { delay, error, .. } => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "job failed; retry scheduled"
                );
                self.dispatcher.signal().notify();
            }
            RetryDecision::Dead { error } => {
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    error = %error,
                    "job moved to dead letter queue"
                );
            }
        }

        Ok(updated)
    }

    fn apply(&self, job: &Job, decision: &RetryDecision) -> Result<Job, JobStoreError> {
        let store = self.dispatcher.store();
        let mut attempt = 1;
        loop {
            let result = match decision {
                RetryDecision::Succeed => store.mark_succeeded(&job.id),
                RetryDecision::Retry {
                    next_attempt_at,
                    error,
                    ..
                } => store.mark_retry(&job.id, *next_attempt_at, error),
                RetryDecision::Dead { error } => store.mark_dead(&job.id, error),
            };

            match result {
                Err(err) if err.is_unavailable() && attempt < REPORT_ATTEMPTS => {
                    warn!(worker_id = %self.id, job_id = %job.id, error = %err, attempt, "store unavailable; retrying outcome write");
                    thread::sleep(self.dispatcher.poll_interval());
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{DateTime, TimeZone, Utc};
    use queuectl_core::{JobId, ManualClock};

    use super::*;
    use crate::jobs::command::{CommandError, CommandOutput};
    use crate::jobs::dispatcher::WakeSignal;
    use crate::jobs::store::contract::FlakyStore;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use crate::jobs::types::{JobState, NewJob};

    /// Runner returning scripted exit codes in order.
    struct ScriptedRunner {
        codes: Mutex<Vec<i32>>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, _command: &str, _timeout: Option<Duration>) -> Result<CommandOutput, CommandError> {
            let code = self.codes.lock().unwrap().remove(0);
            Ok(CommandOutput {
                exit_code: Some(code),
                stdout: String::new(),
                stderr: if code == 0 { String::new() } else { "boom".to_string() },
                duration: Duration::ZERO,
            })
        }
    }

    fn start_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn worker_on(
        store: Arc<dyn JobStore>,
        clock: Arc<ManualClock>,
        codes: Vec<i32>,
        policy: RetryPolicy,
    ) -> Worker {
        let dispatcher =
            Dispatcher::new(store, Arc::new(WakeSignal::new()), Duration::from_millis(10))
                .with_clock(clock);
        Worker::new(
            WorkerId::generate(0),
            dispatcher,
            Arc::new(ScriptedRunner {
                codes: Mutex::new(codes),
            }),
            policy,
            None,
        )
    }

    fn default_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    fn setup(codes: Vec<i32>) -> (Worker, Arc<InMemoryJobStore>, Arc<ManualClock>) {
        let clock = start_clock();
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let worker = worker_on(store.clone(), clock.clone(), codes, default_policy());
        (worker, store, clock)
    }

    fn flaky_setup(
        codes: Vec<i32>,
    ) -> (Worker, Arc<FlakyStore<InMemoryJobStore>>, Arc<ManualClock>) {
        let clock = start_clock();
        let store = Arc::new(FlakyStore::new(InMemoryJobStore::with_clock(clock.clone())));
        let worker = worker_on(store.clone(), clock.clone(), codes, default_policy());
        (worker, store, clock)
    }

    fn claim(worker: &Worker) -> Job {
        let shutdown = AtomicBool::new(false);
        worker.dispatcher.acquire(worker.id(), &shutdown).unwrap()
    }

    #[test]
    fn success_marks_job_succeeded() {
        let (worker, store, clock) = setup(vec![0]);
        let job = NewJob::new(JobId::new("a").unwrap(), "true")
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();

        let running = claim(&worker);
        worker.process(&running);

        let stored = store.get(&running.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert!(stored.claimed_by.is_none());
    }

    #[test]
    fn failures_back_off_then_dead_letter() {
        let (worker, store, clock) = setup(vec![1, 1, 1]);
        let t0 = clock.now();
        let job = NewJob::new(JobId::new("flaky").unwrap(), "false")
            .with_max_attempts(3)
            .into_job(3, t0)
            .unwrap();
        store.submit(job).unwrap();
        let id = JobId::new("flaky").unwrap();

        worker.process(&claim(&worker));
        let first = store.get(&id).unwrap().unwrap();
        assert_eq!(first.state, JobState::RetryReady);
        assert_eq!(first.next_attempt_at, t0 + chrono::Duration::seconds(1));
        assert_eq!(first.last_error.as_deref(), Some("exit code 1: boom"));

        clock.advance(Duration::from_secs(1));
        let t1 = clock.now();
        worker.process(&claim(&worker));
        let second = store.get(&id).unwrap().unwrap();
        assert_eq!(second.state, JobState::RetryReady);
        assert_eq!(second.next_attempt_at, t1 + chrono::Duration::seconds(2));

        clock.advance(Duration::from_secs(2));
        worker.process(&claim(&worker));
        let dead = store.get(&id).unwrap().unwrap();
        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempt_count, 3);
        assert!(dead.last_error.is_some());
    }

    #[test]
    fn reporting_a_finished_job_again_is_rejected() {
        let (worker, store, clock) = setup(vec![0]);
        let job = NewJob::new(JobId::new("a").unwrap(), "true")
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();

        let running = claim(&worker);
        worker.process(&running);

        let err = worker.report(&running, &JobOutcome::Success).unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
    }

    #[test]
    fn outcome_write_survives_transient_outage() {
        let (worker, store, clock) = flaky_setup(vec![0]);
        let job = NewJob::new(JobId::new("a").unwrap(), "true")
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();
        store.fail_outcomes(2);

        let running = claim(&worker);
        let done = worker.report(&running, &worker.execute(&running)).unwrap();

        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(store.outcome_calls(), 3);
    }

    #[test]
    fn outcome_write_gives_up_after_bounded_attempts() {
        let (worker, store, clock) = flaky_setup(vec![1]);
        let job = NewJob::new(JobId::new("a").unwrap(), "false")
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();
        store.fail_outcomes(u32::MAX);

        let running = claim(&worker);
        let err = worker
            .report(&running, &worker.execute(&running))
            .unwrap_err();

        assert!(err.is_unavailable());
        assert_eq!(store.outcome_calls(), REPORT_ATTEMPTS);
        let stored = store.get(&running.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert!(stored.last_error.is_none());
    }

    #[test]
    fn resubmitted_job_restarts_backoff_schedule() {
        let (worker, store, clock) = setup(vec![1, 1, 1, 1]);
        let id = JobId::new("flaky").unwrap();
        let job = NewJob::new(id.clone(), "false")
            .with_max_attempts(3)
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();

        for delay in [0, 1, 2] {
            clock.advance(Duration::from_secs(delay));
            worker.process(&claim(&worker));
        }
        assert_eq!(store.get(&id).unwrap().unwrap().state, JobState::Dead);

        clock.advance(Duration::from_secs(600));
        let fresh = store.resubmit_from_dlq(&id).unwrap();
        assert_eq!(fresh.attempt_count, 0);

        let now = clock.now();
        worker.process(&claim(&worker));
        let retried = store.get(&id).unwrap().unwrap();
        assert_eq!(retried.state, JobState::RetryReady);
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(retried.next_attempt_at, now + chrono::Duration::seconds(1));
    }

    #[test]
    fn huge_retry_delay_is_reported() {
        let clock = start_clock();
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let worker = worker_on(
            store.clone(),
            clock.clone(),
            vec![1],
            RetryPolicy::new(Duration::MAX, Duration::MAX),
        );
        let job = NewJob::new(JobId::new("a").unwrap(), "false")
            .into_job(3, clock.now())
            .unwrap();
        store.submit(job).unwrap();

        let running = claim(&worker);
        let retried = worker.report(&running, &worker.execute(&running)).unwrap();

        assert_eq!(retried.state, JobState::RetryReady);
        assert_eq!(retried.next_attempt_at, DateTime::<Utc>::MAX_UTC);
    }
}
