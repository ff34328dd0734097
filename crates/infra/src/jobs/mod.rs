//! Background job engine: claim, execute, retry with backoff, dead-letter.
//!
//! ## Design
//!
//! - The `JobStore` is the single source of truth; exclusivity is enforced
//!   only by its atomic `claim_next`
//! - Workers are OS threads sharing one `Dispatcher`, a wake-up signal and a
//!   shutdown flag
//! - Retry timing is a pure function of the attempt count and persisted as
//!   `next_attempt_at`, so it survives restarts
//! - Jobs that exhaust their attempts land in the dead letter queue
//!
//! ## Components
//!
//! - `JobQueue`: submission and status queries
//! - `JobStore`: persistence (`InMemoryJobStore`, `SqliteJobStore`)
//! - `Dispatcher`: hands claimed jobs to idle workers
//! - `Worker` / `WorkerPool`: execution contexts and their lifecycle
//! - `RetryPolicy`: backoff and the retry vs. dead-letter decision
//! - `DeadLetterQueue`: inspection and re-submission of dead jobs

pub mod command;
pub mod dispatcher;
pub mod dlq;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod worker;

pub use command::{CommandError, CommandOutput, CommandRunner, ShellCommandRunner};
pub use dispatcher::{Dispatcher, WakeSignal};
pub use dlq::DeadLetterQueue;
pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use queue::{JobQueue, SubmitError};
pub use retry::{RetryDecision, RetryPolicy};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Job, JobOutcome, JobState, JobStats, NewJob};
pub use worker::Worker;
