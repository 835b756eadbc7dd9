//! Tracing and logging setup shared by the engine's binaries.

/// Initialize process-wide tracing from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filter, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat};
