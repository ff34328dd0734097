//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use queuectl_core::{DomainError, DomainResult, JobId, WorkerId};

/// Lifecycle state of a job.
///
/// `Pending`/`RetryReady` are claimable once `next_attempt_at` has passed.
/// `Claimed`/`Running` are held by exactly one worker. `Succeeded` and `Dead`
/// are terminal; only a DLQ re-submission moves a `Dead` job again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted, waiting for its first claim
    Pending,
    /// Claimed by a worker, not started yet
    Claimed,
    /// Command is executing
    Running,
    /// Completed successfully
    Succeeded,
    /// Failed, waiting for its backoff to elapse
    RetryReady,
    /// Exhausted its attempts; lives in the DLQ
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Claimed,
        JobState::Running,
        JobState::Succeeded,
        JobState::RetryReady,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::RetryReady => "retry_ready",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead)
    }

    /// States a claim may pick a job up from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::RetryReady)
    }

    /// States in which a worker holds the job.
    pub fn is_held(&self) -> bool {
        matches!(self, JobState::Claimed | JobState::Running)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::invalid_value(format!("unknown job state: {s}")))
    }
}

/// A submission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Earliest time of the first attempt; immediate when absent.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(id: JobId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            max_attempts: None,
            run_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Validate the request and build the job record to insert.
    pub fn into_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> DomainResult<Job> {
        if self.command.trim().is_empty() {
            return Err(DomainError::validation("command must not be empty"));
        }
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }

        Ok(Job {
            id: self.id,
            command: self.command,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts,
            next_attempt_at: self.run_at.map_or(now, |at| at.max(now)),
            claimed_by: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A job record as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Number of claims so far (1-indexed once claimed)
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    /// Worker holding the job; only set while `Claimed`/`Running`
    pub claimed_by: Option<WorkerId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a claim at `now` may pick this job.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable()
            && self.next_attempt_at <= now
            && self.attempt_count < self.max_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Command completed normally
    Success,
    /// Non-zero exit, timeout, or the command could not start
    Failure { message: String },
}

impl JobOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub retry_ready: usize,
    pub dead: usize,
}

impl JobStats {
    pub fn record(&mut self, state: JobState) {
        self.add(state, 1);
    }

    pub fn add(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Claimed => self.claimed += n,
            JobState::Running => self.running += n,
            JobState::Succeeded => self.succeeded += n,
            JobState::RetryReady => self.retry_ready += n,
            JobState::Dead => self.dead += n,
        }
    }

    pub fn count(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Claimed => self.claimed,
            JobState::Running => self.running,
            JobState::Succeeded => self.succeeded,
            JobState::RetryReady => self.retry_ready,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|s| self.count(*s)).sum()
    }
}

impl<'a> FromIterator<&'a Job> for JobStats {
    fn from_iter<I: IntoIterator<Item = &'a Job>>(iter: I) -> Self {
        let mut stats = JobStats::default();
        for job in iter {
            stats.record(job.state);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("processing".parse::<JobState>().is_err());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::RetryReady).unwrap();
        assert_eq!(json, "\"retry_ready\"");
    }

    #[test]
    fn new_job_uses_default_max_attempts() {
        let now = Utc::now();
        let job = NewJob::new(id("a"), "echo hi").into_job(3, now).unwrap();

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.next_attempt_at, now);
        assert!(job.claimed_by.is_none());
    }

    #[test]
    fn new_job_validation() {
        let now = Utc::now();
        assert!(NewJob::new(id("a"), "  ").into_job(3, now).is_err());
        assert!(
            NewJob::new(id("a"), "true")
                .with_max_attempts(0)
                .into_job(3, now)
                .is_err()
        );
    }

    #[test]
    fn run_at_delays_eligibility() {
        let now = Utc::now();
        let later = now + Duration::seconds(10);
        let job = NewJob::new(id("a"), "true").run_at(later).into_job(3, now).unwrap();

        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(later));
    }

    #[test]
    fn stats_count_every_state() {
        let now = Utc::now();
        let mut jobs = Vec::new();
        for (i, state) in JobState::ALL.into_iter().enumerate() {
            let mut job = NewJob::new(id(&format!("j{i}")), "true").into_job(3, now).unwrap();
            job.state = state;
            jobs.push(job);
        }

        let stats: JobStats = jobs.iter().collect();
        assert_eq!(stats.total(), 6);
        for state in JobState::ALL {
            assert_eq!(stats.count(state), 1);
        }
    }
}
