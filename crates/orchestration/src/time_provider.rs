//! Time source for controllers and tracing.
//!
//! Decouples everything that stamps timestamps from the policy that
//! produces them: synchronized virtual time, wall clock, or none.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where [`TimeProvider::now`] gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeProviderKind {
    /// No time source configured; `now` is always zero.
    NoSync,
    /// Wall-clock time since the provider was created.
    WallClock,
    /// Synchronized virtual time fed by the time sync service.
    SyncTime,
}

struct ProviderState {
    kind: parking_lot::Mutex<TimeProviderKind>,
    virtual_now_ns: AtomicU64,
    epoch: Instant,
}

/// Cheap shared handle; clones observe the same source.
#[derive(Clone)]
pub struct TimeProvider {
    state: Arc<ProviderState>,
}

impl TimeProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ProviderState {
                kind: parking_lot::Mutex::new(TimeProviderKind::NoSync),
                virtual_now_ns: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn kind(&self) -> TimeProviderKind {
        *self.state.kind.lock()
    }

    pub fn set_kind(&self, kind: TimeProviderKind) {
        *self.state.kind.lock() = kind;
    }

    /// Current time under the configured source.
    pub fn now(&self) -> Duration {
        match self.kind() {
            TimeProviderKind::NoSync => Duration::ZERO,
            TimeProviderKind::WallClock => self.state.epoch.elapsed(),
            TimeProviderKind::SyncTime => {
                Duration::from_nanos(self.state.virtual_now_ns.load(Ordering::Acquire))
            }
        }
    }

    /// Advance the virtual clock. Called by the time sync service at each
    /// step; virtual time never moves backwards.
    pub fn set_virtual_now(&self, now: Duration) {
        self.state
            .virtual_now_ns
            .fetch_max(now.as_nanos() as u64, Ordering::AcqRel);
    }

    /// Forget virtual progress (lifecycle restart).
    pub fn reset_virtual_time(&self) {
        self.state.virtual_now_ns.store(0, Ordering::Release);
    }
}

impl Default for TimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_sync_is_zero() {
        let provider = TimeProvider::new();
        assert_eq!(provider.now(), Duration::ZERO);
    }

    #[test]
    fn test_sync_time_follows_the_feed() {
        let provider = TimeProvider::new();
        provider.set_kind(TimeProviderKind::SyncTime);
        provider.set_virtual_now(Duration::from_millis(5));
        assert_eq!(provider.now(), Duration::from_millis(5));
    }

    #[test]
    fn test_virtual_time_never_goes_backwards() {
        let provider = TimeProvider::new();
        provider.set_kind(TimeProviderKind::SyncTime);
        provider.set_virtual_now(Duration::from_millis(5));
        provider.set_virtual_now(Duration::from_millis(3));
        assert_eq!(provider.now(), Duration::from_millis(5));
    }

    #[test]
    fn test_clones_share_the_source() {
        let provider = TimeProvider::new();
        let observer = provider.clone();
        provider.set_kind(TimeProviderKind::SyncTime);
        provider.set_virtual_now(Duration::from_millis(2));
        assert_eq!(observer.now(), Duration::from_millis(2));
    }
}
