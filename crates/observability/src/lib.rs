//! Tracing/logging setup shared by every taskhub process.

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat, ParseLogFormatError};

/// Initialize process-wide tracing with the default [`LogConfig`].
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&LogConfig::default());
}

/// Initialize process-wide tracing from `config`. Later calls are no-ops.
pub fn init_with(config: &LogConfig) {
    tracing::init_with(config);
}
