//! Tracing subscriber setup for tests embedding the engine

use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber, ignoring "already initialized" errors
///
/// Honours `RUST_LOG`, defaulting to `debug`.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
