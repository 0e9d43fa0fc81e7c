//! Lag measurement and aggregation
//!
//! A [`LagDetector`] wakes on a fast repeating timer and compares the time
//! that actually passed since its previous wake-up with the interval it
//! asked for. The difference is the scheduler lag for that tick. Lag is
//! signed: a timer that fires early produces a small negative correction,
//! so the aggregate tracks net drift instead of only ever growing.

use super::histogram::LagHistogram;
use crate::clock::Clock;
use crate::emitter::{EventTags, Level, LogEmitter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Title of the immediate event logged for a single long pause
pub const PAUSE_DETECTED: &str = "Pause Detected";

/// Signed scheduler lag with microsecond resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LagSample {
    micros: i64,
}

impl LagSample {
    pub const ZERO: LagSample = LagSample { micros: 0 };

    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis.saturating_mul(1000),
        }
    }

    /// Lag of an interval that was expected to take `expected` but took
    /// `elapsed`
    pub fn between(elapsed: Duration, expected: Duration) -> Self {
        Self {
            micros: duration_micros(elapsed) - duration_micros(expected),
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.micros as f64 / 1000.0
    }

    pub fn is_positive(&self) -> bool {
        self.micros > 0
    }
}

fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Running sum of lag samples since the last flush
#[derive(Debug, Default)]
struct AggregatedLag {
    micros: AtomicI64,
}

impl AggregatedLag {
    fn add(&self, sample: LagSample) {
        self.micros.fetch_add(sample.micros, Ordering::AcqRel);
    }

    /// Read and reset in a single step
    fn drain(&self) -> LagSample {
        LagSample::from_micros(self.micros.swap(0, Ordering::AcqRel))
    }

    fn peek(&self) -> LagSample {
        LagSample::from_micros(self.micros.load(Ordering::Acquire))
    }
}

/// Exclusive right to drain the aggregated lag
///
/// There is exactly one flusher per detector. It is not `Clone`, and
/// [`LagFlusher::flush`] takes `&mut self`, so two reporting cycles can
/// never reset the same window.
#[derive(Debug)]
pub struct LagFlusher {
    aggregate: Arc<AggregatedLag>,
}

impl LagFlusher {
    /// Return the lag accumulated since the previous flush and reset it to zero
    pub fn flush(&mut self) -> LagSample {
        self.aggregate.drain()
    }

    /// Lag accumulated so far in the current window, without resetting it
    pub fn peek(&self) -> LagSample {
        self.aggregate.peek()
    }
}

/// Shared handle to a detector's lag histogram
pub type SharedHistogram = Arc<Mutex<LagHistogram>>;

/// Measures scheduler lag between consecutive timer wake-ups
pub struct LagDetector<C: Clock> {
    clock: C,
    sleep_interval: Duration,
    pause_threshold: LagSample,
    /// Clock reading at the previous wake-up (or at construction)
    last_wake: Duration,
    /// Runtime instant at construction; the timer's first deadline is
    /// anchored here so that a scheduler blocked right after start still
    /// shows up as lag on the first tick
    started_at: Instant,
    aggregate: Arc<AggregatedLag>,
    histogram: Option<SharedHistogram>,
    emitter: Arc<dyn LogEmitter>,
    tags: EventTags,
}

impl<C: Clock> LagDetector<C> {
    /// Create a detector and the flusher that drains it
    pub fn new(
        clock: C,
        sleep_interval: Duration,
        pause_threshold: Duration,
        emitter: Arc<dyn LogEmitter>,
        tags: EventTags,
    ) -> (Self, LagFlusher) {
        let aggregate = Arc::new(AggregatedLag::default());
        let last_wake = clock.now();

        let detector = Self {
            clock,
            sleep_interval,
            pause_threshold: LagSample::between(pause_threshold, Duration::ZERO),
            last_wake,
            started_at: Instant::now(),
            aggregate: aggregate.clone(),
            histogram: None,
            emitter,
            tags,
        };

        (detector, LagFlusher { aggregate })
    }

    /// Also record every sample into `histogram`
    pub fn with_histogram(mut self, histogram: SharedHistogram) -> Self {
        self.histogram = Some(histogram);
        self
    }

    pub fn sleep_interval(&self) -> Duration {
        self.sleep_interval
    }

    /// Handle one wake-up of the sampling timer
    pub fn tick(&mut self) -> LagSample {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(self.last_wake);
        let lag = if now >= self.last_wake {
            LagSample::between(elapsed, self.sleep_interval)
        } else {
            // Clock went backwards: the wake-up came even earlier than the
            // previous one
            LagSample::from_micros(
                -duration_micros(self.last_wake - now) - duration_micros(self.sleep_interval),
            )
        };

        if lag > self.pause_threshold {
            let event = self
                .tags
                .event(Level::Info, PAUSE_DETECTED)
                .with("pause_duration", lag.as_millis_f64());
            self.emitter.emit(&event);
        }

        trace!(lag_ms = lag.as_millis_f64(), "Scheduler lag sample");

        self.aggregate.add(lag);
        if let Some(histogram) = &self.histogram {
            histogram
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .record(lag.as_millis_f64());
        }
        self.last_wake = now;

        lag
    }

    /// Tick every `sleep_interval` until shutdown is signalled
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        debug!(
            sleep_interval_ms = self.sleep_interval.as_secs_f64() * 1000.0,
            "Starting scheduler lag detector"
        );

        let mut ticker = interval_at(self.started_at + self.sleep_interval, self.sleep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown.recv() => {
                    debug!("Stopping scheduler lag detector");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::emitter::testing::CapturingEmitter;

    const SLEEP: Duration = Duration::from_millis(100);
    const THRESHOLD: Duration = Duration::from_millis(1000);

    fn detector(
        clock: &ManualClock,
    ) -> (LagDetector<ManualClock>, LagFlusher, Arc<CapturingEmitter>) {
        let emitter = Arc::new(CapturingEmitter::default());
        let (detector, flusher) = LagDetector::new(
            clock.clone(),
            SLEEP,
            THRESHOLD,
            emitter.clone(),
            EventTags::new("source", "test"),
        );
        (detector, flusher, emitter)
    }

    #[test]
    fn test_lag_sample_conversions() {
        let lag = LagSample::between(Duration::from_millis(1600), SLEEP);
        assert_eq!(lag.as_micros(), 1_500_000);
        assert_eq!(lag.as_millis_f64(), 1500.0);
        assert_eq!(LagSample::from_millis(-3).as_micros(), -3000);
        assert!(!LagSample::ZERO.is_positive());
    }

    #[test]
    fn test_flush_without_ticks_is_zero() {
        let clock = ManualClock::new();
        let (_detector, mut flusher, _) = detector(&clock);
        assert_eq!(flusher.flush(), LagSample::ZERO);
    }

    #[test]
    fn test_exact_first_interval_has_no_lag() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(42));
        let (mut detector, mut flusher, emitter) = detector(&clock);

        clock.advance(SLEEP);
        assert_eq!(detector.tick(), LagSample::ZERO);
        assert_eq!(flusher.flush(), LagSample::ZERO);
        assert!(emitter.events().is_empty());
    }

    #[test]
    fn test_lag_accumulates_across_ticks() {
        let clock = ManualClock::new();
        let (mut detector, mut flusher, _) = detector(&clock);

        clock.advance(Duration::from_millis(130));
        assert_eq!(detector.tick(), LagSample::from_millis(30));
        clock.advance(Duration::from_millis(150));
        assert_eq!(detector.tick(), LagSample::from_millis(50));

        assert_eq!(flusher.peek(), LagSample::from_millis(80));
        assert_eq!(flusher.flush(), LagSample::from_millis(80));
    }

    #[test]
    fn test_negative_lag_is_not_clamped() {
        let clock = ManualClock::new();
        let (mut detector, mut flusher, _) = detector(&clock);

        clock.advance(Duration::from_millis(120));
        detector.tick();
        clock.advance(Duration::from_millis(95));
        assert_eq!(detector.tick(), LagSample::from_millis(-5));

        assert_eq!(flusher.flush(), LagSample::from_millis(15));
    }

    #[test]
    fn test_clock_moving_backwards_is_a_negative_sample() {
        let clock = ManualClock::new();
        clock.set(Duration::from_millis(500));
        let (mut detector, _flusher, _) = detector(&clock);

        clock.set(Duration::from_millis(490));
        assert_eq!(detector.tick(), LagSample::from_millis(-110));
    }

    #[test]
    fn test_sub_millisecond_threshold() {
        let clock = ManualClock::new();
        let emitter = Arc::new(CapturingEmitter::default());
        let (mut detector, _flusher) = LagDetector::new(
            clock.clone(),
            Duration::from_micros(500),
            Duration::from_micros(1999),
            emitter.clone(),
            EventTags::new("source", "test"),
        );

        clock.advance(Duration::from_micros(500 + 1500));
        detector.tick();
        assert!(emitter.titled(PAUSE_DETECTED).is_empty());

        clock.advance(Duration::from_micros(500 + 2000));
        assert_eq!(detector.tick(), LagSample::from_micros(2000));
        assert_eq!(emitter.titled(PAUSE_DETECTED).len(), 1);
    }

    #[test]
    fn test_second_flush_returns_zero() {
        let clock = ManualClock::new();
        let (mut detector, mut flusher, _) = detector(&clock);

        clock.advance(Duration::from_millis(400));
        detector.tick();

        assert_eq!(flusher.flush(), LagSample::from_millis(300));
        assert_eq!(flusher.flush(), LagSample::ZERO);
    }

    #[test]
    fn test_pause_event_only_above_threshold() {
        let clock = ManualClock::new();
        let (mut detector, mut flusher, emitter) = detector(&clock);

        // Lag exactly at the threshold is not a pause
        clock.advance(SLEEP + THRESHOLD);
        assert_eq!(detector.tick(), LagSample::from_millis(1000));
        assert!(emitter.titled(PAUSE_DETECTED).is_empty());

        clock.advance(SLEEP + THRESHOLD + Duration::from_millis(1));
        detector.tick();

        let pauses = emitter.titled(PAUSE_DETECTED);
        assert_eq!(pauses.len(), 1);
        assert_eq!(pauses[0].level, Level::Info);
        assert_eq!(
            pauses[0].attribute("pause_duration").and_then(|v| v.as_f64()),
            Some(1001.0)
        );
        assert_eq!(
            pauses[0].attribute("env").and_then(|v| v.as_str()),
            Some("test")
        );

        // Both ticks count toward the aggregate
        assert_eq!(flusher.flush(), LagSample::from_millis(2001));
    }

    #[test]
    fn test_histogram_receives_samples() {
        let clock = ManualClock::new();
        let (detector, _flusher, _) = detector(&clock);
        let histogram: SharedHistogram = Arc::new(Mutex::new(LagHistogram::new()));
        let mut detector = detector.with_histogram(histogram.clone());

        clock.advance(Duration::from_millis(110));
        detector.tick();
        clock.advance(Duration::from_millis(140));
        detector.tick();

        let snapshot = histogram.lock().unwrap().read().unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.max, 40.0);
        assert_eq!(snapshot.stalled, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_on_interval_until_shutdown() {
        let clock = crate::clock::MonotonicClock::new();
        let emitter = Arc::new(CapturingEmitter::default());
        let (detector, mut flusher) = LagDetector::new(
            clock,
            SLEEP,
            THRESHOLD,
            emitter,
            EventTags::new("source", "test"),
        );
        let histogram: SharedHistogram = Arc::new(Mutex::new(LagHistogram::new()));
        let detector = detector.with_histogram(histogram.clone());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(detector.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(histogram.lock().unwrap().read().unwrap().count, 10);

        // Paused time fires every tick on schedule
        assert!(flusher.flush().as_micros().abs() < 1000);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
