//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

/// Caller-supplied identifier of a job.
///
/// Job ids are chosen by the submitter (not generated), so they are plain
/// strings. The only rule is that they are non-empty once trimmed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Identity of a worker execution context.
///
/// Stored as `claimed_by` on jobs it holds, so it must stay stable for the
/// lifetime of the worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> DomainResult<Self> {
                let value = value.into();
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(concat!($name, " must not be empty")));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_newtype!(JobId, "job id");
impl_string_newtype!(WorkerId, "worker id");

impl WorkerId {
    /// Generate a worker id of the form `worker-<index>-<8 hex>`.
    ///
    /// The random suffix keeps ids unique across pool restarts, so a stale
    /// `claimed_by` from a previous run never matches a live worker.
    pub fn generate(index: usize) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{index}-{}", &suffix[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_trimmed() {
        let id = JobId::new("  job-1 ").unwrap();
        assert_eq!(id.as_str(), "job-1");
    }

    #[test]
    fn empty_job_id_is_rejected() {
        assert!(matches!(JobId::new("   "), Err(DomainError::InvalidId(_))));
        assert!("".parse::<JobId>().is_err());
    }

    #[test]
    fn generated_worker_ids_are_unique_and_shaped() {
        let a = WorkerId::generate(0);
        let b = WorkerId::generate(0);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-0-"));
        assert_eq!(a.as_str().len(), "worker-0-".len() + 8);
    }

    #[test]
    fn job_id_serde_validates() {
        let id: JobId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id.as_str(), "abc");
        assert!(serde_json::from_str::<JobId>("\"\"").is_err());
    }
}
