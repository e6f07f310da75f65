//! Process-wide logging setup shared by bus binaries.

/// Subscriber configuration (format, filters).
pub mod logging;

pub use logging::{LogFormat, init_with};

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    logging::init_with(LogFormat::Json);
}
