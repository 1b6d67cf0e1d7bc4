//! Process-wide tracing/logging setup.

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};

/// Initialize logging from the environment (`RUST_LOG`, `PIPEDESK_LOG_FORMAT`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&LogConfig::from_env());
}
