//! Shared helpers for tests.

use std::sync::Once;

/// Installs a test-writer tracing subscriber once per process.
///
/// Call at the top of any test whose diagnostics you want captured; repeated
/// calls are no-ops.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}
