//! Time sources for the sampling loops
//!
//! The detector only needs "how much time has passed since some fixed
//! origin", so clocks report a [`Duration`] rather than an instant. This
//! keeps the lag arithmetic independent of where the time comes from.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source
pub trait Clock: Send + Sync + 'static {
    /// Elapsed time since the clock's origin
    fn now(&self) -> Duration;
}

/// Clock backed by the tokio runtime's monotonic instant
///
/// Follows tokio's paused time when the runtime is started with
/// `start_paused`, which makes interval-driven tests deterministic.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock
///
/// Clones share the same time, so a test can keep one handle and give
/// another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute offset from the origin
    ///
    /// Going backwards is allowed, which lets tests simulate a timer that
    /// fires early.
    pub fn set(&self, at: Duration) {
        self.micros.store(at.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}
