//! Subscriber setup for binaries and tests embedding the control plane.
//!
//! The library itself only emits `tracing` events and spans; installing a subscriber
//! is left to the process.
use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// Does nothing if a subscriber is already installed.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .try_init();
}

/// Like [`init`], but writes through the test harness so output is captured per test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .try_init();
}
