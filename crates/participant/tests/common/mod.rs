//! Shared helpers for the end-to-end tests.

use std::time::{Duration, Instant};

/// Poll `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Generous bound for cross-participant propagation on loopback.
pub const PROPAGATION: Duration = Duration::from_secs(10);
