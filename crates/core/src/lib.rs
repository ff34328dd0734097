//! `queuectl-core`: foundation types shared by the job engine.
//!
//! This crate contains **pure** primitives (no storage, no threads): validated
//! identifiers, the domain error type and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
