//! Shared helpers for unit tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a test-writer `tracing` subscriber once per test binary.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .with_target(false)
            .try_init();
    });
}

/// Logs the start of a test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Logs entry into a named section of a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::info!(section = $name, "--- section ---");
    };
}

/// Logs the successful end of a test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion that logs expected and actual values before failing.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
