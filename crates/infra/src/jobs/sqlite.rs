//! SQLite-backed job store.
//!
//! A single database file holds the `jobs` table. Every state change is one
//! conditional `UPDATE ... RETURNING` statement, so a transition either lands
//! completely or not at all, and a crash never leaves a half-written job.
//!
//! ## Claiming
//!
//! `claim_next` selects and claims in one statement:
//!
//! ```sql
//! UPDATE jobs SET state = 'claimed', ...
//! WHERE id = (SELECT id FROM jobs WHERE <eligible> ORDER BY ... LIMIT 1)
//!   AND state IN ('pending', 'retry_ready')
//! RETURNING ...
//! ```
//!
//! SQLite serializes writers, so two workers can never both receive the
//! same row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation on `id`) | `DuplicateJob` |
//! | Any other error | `StoreUnavailable` |
//! | Undecodable row | `Corrupt` |
//!
//! ## Runtime
//!
//! The `JobStore` trait is synchronous. The store owns a small tokio runtime
//! and blocks on it, so it must not be called from inside an async context.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use tokio::runtime::Runtime;
use tracing::instrument;

use queuectl_core::{Clock, JobId, SystemClock, WorkerId};

use super::store::{JobStore, JobStoreError, ORPHAN_ERROR};
use super::types::{Job, JobState, JobStats};

const COLUMNS: &str = "seq, id, command, state, attempt_count, max_attempts, next_attempt_at, \
                       claimed_by, last_error, created_at, updated_at";

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        command TEXT NOT NULL,
        state TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        next_attempt_at INTEGER NOT NULL,
        claimed_by TEXT,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_claim
        ON jobs (state, next_attempt_at, created_at, seq)
    "#,
];

/// Durable job store in a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
    clock: Arc<dyn Clock>,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {:?}", parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let runtime = build_runtime()?;
        let pool = runtime
            .block_on(SqlitePoolOptions::new().max_connections(4).connect_with(options))
            .with_context(|| format!("failed to open job database at {:?}", path))?;

        Self::init(pool, runtime)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// Pinned to a single connection that never expires; every connection
    /// to `:memory:` would otherwise see its own empty database.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory sqlite url")?;

        let runtime = build_runtime()?;
        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options),
            )
            .context("failed to open in-memory job database")?;

        Self::init(pool, runtime)
    }

    fn init(pool: SqlitePool, runtime: Runtime) -> anyhow::Result<Self> {
        runtime
            .block_on(async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&pool).await?;
                }
                Ok::<_, sqlx::Error>(())
            })
            .context("failed to initialize jobs schema")?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock used for audit timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Close all pooled connections.
    pub fn close(&self) {
        self.runtime.block_on(self.pool.close());
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn fetch_one_job(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    /// Turn the result of a conditional update into the job or the reason
    /// the guard did not match.
    fn finish(
        &self,
        id: &JobId,
        target: JobState,
        row: Option<SqliteRow>,
    ) -> Result<Job, JobStoreError> {
        if let Some(row) = row {
            return decode(&row);
        }

        match self.fetch_one_job(id)? {
            None => Err(JobStoreError::NotFound(id.clone())),
            Some(job) => Err(JobStoreError::InvalidTransition {
                id: id.clone(),
                state: job.state,
                target,
            }),
        }
    }
}

fn build_runtime() -> anyhow::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("queuectl-sqlite")
        .enable_all()
        .build()
        .context("failed to build sqlite runtime")
}

impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(job_id = %job.id), err)]
    fn submit(&self, job: Job) -> Result<Job, JobStoreError> {
        let sql = format!(
            "INSERT INTO jobs (id, command, state, attempt_count, max_attempts, next_attempt_at, \
             claimed_by, last_error, created_at, updated_at) \
             VALUES (?, ?, 'pending', 0, ?, ?, NULL, ?, ?, ?) \
             RETURNING {COLUMNS}"
        );

        let result = self.runtime.block_on(
            sqlx::query(&sql)
                .bind(job.id.as_str())
                .bind(&job.command)
                .bind(i64::from(job.max_attempts))
                .bind(job.next_attempt_at.timestamp_millis())
                .bind(job.last_error.as_deref())
                .bind(job.created_at.timestamp_millis())
                .bind(job.updated_at.timestamp_millis())
                .fetch_one(&self.pool),
        );

        match result {
            Ok(row) => decode(&row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(JobStoreError::DuplicateJob(job.id))
            }
            Err(e) => Err(map_sqlx_error("submit", e)),
        }
    }

    #[instrument(skip_all, fields(worker_id = %worker_id), err)]
    fn claim_next(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs \
             SET state = 'claimed', claimed_by = ?, attempt_count = attempt_count + 1, updated_at = ? \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE state IN ('pending', 'retry_ready') \
                   AND next_attempt_at <= ? \
                   AND attempt_count < max_attempts \
                 ORDER BY next_attempt_at, created_at, seq \
                 LIMIT 1 \
             ) \
             AND state IN ('pending', 'retry_ready') \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(worker_id.as_str())
                    .bind(self.now_millis())
                    .bind(now.timestamp_millis())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    fn mark_running(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET state = 'running', updated_at = ? \
             WHERE id = ? AND state = 'claimed' \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(self.now_millis())
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_running", e))?;

        self.finish(id, JobState::Running, row)
    }

    fn mark_succeeded(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET state = 'succeeded', claimed_by = NULL, updated_at = ? \
             WHERE id = ? AND state = 'running' \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(self.now_millis())
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_succeeded", e))?;

        self.finish(id, JobState::Succeeded, row)
    }

    fn mark_retry(
        &self,
        id: &JobId,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET state = 'retry_ready', claimed_by = NULL, \
                 next_attempt_at = MAX(?, next_attempt_at), last_error = ?, updated_at = ? \
             WHERE id = ? AND state = 'running' \
               AND attempt_count < max_attempts \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(next_attempt_at.timestamp_millis())
                    .bind(last_error)
                    .bind(self.now_millis())
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_retry", e))?;

        self.finish(id, JobState::RetryReady, row)
    }

    fn mark_dead(&self, id: &JobId, last_error: &str) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET state = 'dead', claimed_by = NULL, last_error = ?, updated_at = ? \
             WHERE id = ? AND state = 'running' \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(last_error)
                    .bind(self.now_millis())
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("mark_dead", e))?;

        self.finish(id, JobState::Dead, row)
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch_one_job(id)
    }

    fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM jobs WHERE state = ? ORDER BY created_at, seq"
                );
                self.runtime.block_on(
                    sqlx::query(&sql)
                        .bind(state.as_str())
                        .fetch_all(&self.pool),
                )
            }
            None => {
                let sql = format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at, seq");
                self.runtime
                    .block_on(sqlx::query(&sql).fetch_all(&self.pool))
            }
        }
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode).collect()
    }

    fn resubmit_from_dlq(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let now = self.now_millis();
        let sql = format!(
            "UPDATE jobs SET state = 'pending', attempt_count = 0, last_error = NULL, \
                 claimed_by = NULL, next_attempt_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'dead' \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(now)
                    .bind(now)
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("resubmit_from_dlq", e))?;

        if let Some(row) = row {
            return decode(&row);
        }

        match self.fetch_one_job(id)? {
            None => Err(JobStoreError::NotFound(id.clone())),
            Some(job) => Err(JobStoreError::NotDead {
                id: id.clone(),
                state: job.state,
            }),
        }
    }

    fn release_orphan(&self, id: &JobId) -> Result<Job, JobStoreError> {
        let now = self.now_millis();
        let sql = format!(
            "UPDATE jobs SET \
                 state = CASE WHEN attempt_count >= max_attempts THEN 'dead' ELSE 'retry_ready' END, \
                 next_attempt_at = CASE WHEN attempt_count >= max_attempts \
                     THEN next_attempt_at ELSE MAX(?, next_attempt_at) END, \
                 claimed_by = NULL, last_error = ?, updated_at = ? \
             WHERE id = ? AND state IN ('claimed', 'running') \
             RETURNING {COLUMNS}"
        );

        let row = self
            .runtime
            .block_on(
                sqlx::query(&sql)
                    .bind(now)
                    .bind(ORPHAN_ERROR)
                    .bind(now)
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("release_orphan", e))?;

        self.finish(id, JobState::RetryReady, row)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows: Vec<(String, i64)> = self
            .runtime
            .block_on(
                sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for (state, count) in rows {
            let state = JobState::from_str(&state)
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats.add(state, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

/// Raw `jobs` row.
#[derive(Debug, FromRow)]
struct JobRow {
    #[allow(dead_code)]
    seq: i64,
    id: String,
    command: String,
    state: String,
    attempt_count: i64,
    max_attempts: i64,
    next_attempt_at: i64,
    claimed_by: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str| JobStoreError::Corrupt(format!("job {}: invalid {what}", row.id));

        Ok(Job {
            id: JobId::new(row.id.clone()).map_err(|_| corrupt("id"))?,
            state: JobState::from_str(&row.state).map_err(|_| corrupt("state"))?,
            attempt_count: u32::try_from(row.attempt_count).map_err(|_| corrupt("attempt_count"))?,
            max_attempts: u32::try_from(row.max_attempts).map_err(|_| corrupt("max_attempts"))?,
            next_attempt_at: millis_to_datetime(row.next_attempt_at)
                .ok_or_else(|| corrupt("next_attempt_at"))?,
            claimed_by: row
                .claimed_by
                .as_deref()
                .map(WorkerId::new)
                .transpose()
                .map_err(|_| corrupt("claimed_by"))?,
            created_at: millis_to_datetime(row.created_at).ok_or_else(|| corrupt("created_at"))?,
            updated_at: millis_to_datetime(row.updated_at).ok_or_else(|| corrupt("updated_at"))?,
            command: row.command,
            last_error: row.last_error,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn decode(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let raw = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to read job row: {}", e)))?;
    Job::try_from(raw)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::StoreUnavailable(format!("{operation}: {err}"))
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use queuectl_core::ManualClock;

    use super::*;
    use crate::jobs::store::contract::*;

    fn setup() -> (SqliteJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = SqliteJobStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
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
    fn concurrent_claims_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = SqliteJobStore::open(dir.path().join("jobs.db"))
            .unwrap()
            .with_clock(clock.clone());

        concurrent_claims_are_exclusive(Arc::new(store), &clock, 6, 30);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let clock = Arc::new(ManualClock::new(start_time()));
        let now = clock.now();
        let retry_at = now + ChronoDuration::seconds(4);

        {
            let store = SqliteJobStore::open(&path).unwrap().with_clock(clock.clone());
            store.submit(new_job("a", 3, now)).unwrap();
            store.claim_next(&worker(1), now).unwrap().unwrap();
            store.mark_running(&job_id("a")).unwrap();
            store.mark_retry(&job_id("a"), retry_at, "exit 1").unwrap();
            store.close();
        }

        let store = SqliteJobStore::open(&path).unwrap().with_clock(clock.clone());
        let job = store.get(&job_id("a")).unwrap().unwrap();
        assert_eq!(job.state, JobState::RetryReady);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.next_attempt_at, retry_at);
        assert_eq!(job.last_error.as_deref(), Some("exit 1"));

        assert!(store.claim_next(&worker(1), now).unwrap().is_none());
        let claimed = store.claim_next(&worker(1), retry_at).unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 2);
    }
}
