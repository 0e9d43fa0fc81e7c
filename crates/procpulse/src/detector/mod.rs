//! Scheduler lag detection
//!
//! This module measures how long the async scheduler takes to service a
//! fast repeating timer. Long-running work that occupies the runtime
//! (or a blocked worker thread) delays the timer, and the delay shows up
//! as lag:
//! - Per-tick lag above a threshold is logged immediately as a pause
//! - All lag is summed into an aggregate drained once per reporting window
//! - Optionally, samples feed a histogram for percentile reporting

mod histogram;
mod lag;

pub use histogram::{HistogramState, LagHistogram, LagSnapshot, DEFAULT_MAX_SAMPLES};
pub use lag::{LagDetector, LagFlusher, LagSample, SharedHistogram, PAUSE_DETECTED};

use crate::clock::{Clock, MonotonicClock};
use crate::emitter::{EventTags, LogEmitter};
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default wake-up period of the sampling timer
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Default lag above which a single tick is logged as a pause
pub const DEFAULT_PAUSE_THRESHOLD: Duration = Duration::from_millis(1000);

/// Configuration for a running detector
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Requested time between wake-ups (default: 100ms)
    pub sleep_interval: Duration,
    /// Lag that triggers an immediate pause event (default: 1s)
    pub pause_threshold: Duration,
    /// Keep a per-window histogram of samples
    pub histogram: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sleep_interval: DEFAULT_SAMPLE_INTERVAL,
            pause_threshold: DEFAULT_PAUSE_THRESHOLD,
            histogram: false,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sleep_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sleep interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Start a detector on the current tokio runtime
pub fn start(
    config: DetectorConfig,
    emitter: Arc<dyn LogEmitter>,
    tags: EventTags,
) -> Result<DetectorHandle> {
    start_with_clock(config, MonotonicClock::new(), emitter, tags)
}

/// Start a detector that measures time with `clock`
pub fn start_with_clock<C: Clock>(
    config: DetectorConfig,
    clock: C,
    emitter: Arc<dyn LogEmitter>,
    tags: EventTags,
) -> Result<DetectorHandle> {
    config.validate()?;
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

    let (detector, flusher) = LagDetector::new(
        clock,
        config.sleep_interval,
        config.pause_threshold,
        emitter,
        tags,
    );

    let histogram = config
        .histogram
        .then(|| Arc::new(Mutex::new(LagHistogram::new())));
    let detector = match &histogram {
        Some(histogram) => detector.with_histogram(histogram.clone()),
        None => detector,
    };

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = runtime.spawn(detector.run(shutdown_rx));

    Ok(DetectorHandle {
        flusher,
        histogram,
        shutdown,
        task: Some(task),
    })
}

/// Owner of a running detector
///
/// Holds the only [`LagFlusher`] for the detector. Dropping the handle
/// stops the detector.
pub struct DetectorHandle {
    flusher: LagFlusher,
    histogram: Option<SharedHistogram>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl DetectorHandle {
    /// Return the lag accumulated since the previous flush and reset it
    pub fn flush(&mut self) -> LagSample {
        self.flusher.flush()
    }

    /// Lag accumulated in the current window, without resetting it
    pub fn peek(&self) -> LagSample {
        self.flusher.peek()
    }

    /// Read the window's histogram and re-arm it for the next window
    ///
    /// Returns `None` when the detector was started without a histogram.
    pub fn take_snapshot(&self) -> Option<Result<LagSnapshot>> {
        let histogram = self.histogram.as_ref()?;
        let mut histogram = histogram
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = histogram.read();
        histogram.rearm();
        Some(snapshot)
    }

    /// Stop ticking and wait for the detector task to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
