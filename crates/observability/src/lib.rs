//! Tracing/logging setup shared by the queuectl binaries.

/// Initialize process-wide logging in the format named by
/// `QUEUECTL_LOG_FORMAT` (JSON when unset).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(LogFormat::from_env());
}

pub use self::tracing::{LogFormat, init_with};

/// Tracing configuration (filters, output format).
pub mod tracing;
