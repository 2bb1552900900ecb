//! Shared helpers for the integration tests.

use std::sync::Once;
use std::time::{Duration, Instant};

/// Installs a tracing subscriber once per test binary. Verbosity follows
/// `RUST_LOG`; output goes through the test writer so it interleaves with
/// the harness correctly.
#[allow(dead_code)]
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` until it holds or `timeout` elapses. Returns whether it
/// held.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
