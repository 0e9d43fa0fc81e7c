//! Periodic metrics reporter
//!
//! Runs independent periodic tasks on the host's tokio runtime:
//! - memory counters every reporting interval
//! - the scheduler lag detector at its own short interval, flushed and
//!   reported every reporting interval
//! - open connection counts every reporting interval, when a counter is set
//!
//! A failure in one task never stops the others; the metric is simply not
//! reported for that cycle.

use crate::config::{ReportingConfig, TitleStyle};
use crate::connections::ConnectionCounter;
use crate::detector::{self, DetectorConfig, DetectorHandle, LagSample, LagSnapshot};
use crate::emitter::{Event, EventTags, JsonLineEmitter, Level, LogEmitter, MetricType};
use crate::error::{Error, Result};
use crate::memory::{MemorySource, ProcessMemory};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Title of the window lag distribution event
pub const EVENT_LOOP_LAG: &str = "event-loop-lag";

/// Title of the scheduler utilization event
pub const EVENT_LOOP_UTILIZATION: &str = "event-loop-utilization";

/// Title of the open connection count event
pub const ACTIVE_CONNECTIONS: &str = "active-connections";

/// Memory counters whose last read failed
///
/// An unavailable counter (e.g. heap counters without jemalloc) fails every
/// cycle. It is warned about once, and again only after it has recovered.
#[derive(Debug, Default)]
pub struct CounterWarnings {
    failing: HashSet<&'static str>,
}

impl CounterWarnings {
    /// Record a failed read; true when this is a new failure
    pub fn failed(&mut self, title: &'static str) -> bool {
        self.failing.insert(title)
    }

    pub fn recovered(&mut self, title: &'static str) {
        self.failing.remove(title);
    }

    pub fn is_failing(&self, title: &str) -> bool {
        self.failing.contains(title)
    }
}

/// Gauge events for every memory counter that could be read
pub fn memory_events(
    tags: &EventTags,
    style: TitleStyle,
    memory: &dyn MemorySource,
    warnings: &mut CounterWarnings,
) -> Vec<Event> {
    let readings = [
        (style.heap_used(), memory.heap_used()),
        (style.heap_total(), memory.heap_total()),
        (style.rss(), memory.rss()),
    ];

    readings
        .into_iter()
        .filter_map(|(title, reading)| match reading {
            Ok(bytes) => {
                warnings.recovered(title);
                Some(tags.gauge(title, bytes))
            }
            Err(e) => {
                if warnings.failed(title) {
                    warn!(title, error = %e, "Memory counter unavailable");
                } else {
                    debug!(title, error = %e, "Skipping memory counter this cycle");
                }
                None
            }
        })
        .collect()
}

/// Events for one flushed lag window
///
/// `window` is how long the window actually lasted. Utilization is the
/// share of it during which the scheduler was too busy to service the
/// sampling timer.
pub fn lag_events(
    tags: &EventTags,
    style: TitleStyle,
    aggregated: LagSample,
    snapshot: Option<LagSnapshot>,
    window: Duration,
) -> Vec<Event> {
    let mut events = vec![tags.gauge(style.aggregated_lag(), aggregated.as_millis_f64())];

    if let Some(snapshot) = snapshot {
        events.push(
            tags.gauge(EVENT_LOOP_LAG, snapshot.mean)
                .with("p50", snapshot.p50)
                .with("p90", snapshot.p90)
                .with("p99", snapshot.p99)
                .with("min", snapshot.min)
                .with("max", snapshot.max)
                .with("count", snapshot.count),
        );

        let window_ms = window.as_secs_f64() * 1000.0;
        let active = snapshot.stalled.clamp(0.0, window_ms);
        let utilization = if window_ms > 0.0 {
            active / window_ms
        } else {
            0.0
        };
        events.push(
            tags.gauge(EVENT_LOOP_UTILIZATION, utilization)
                .with("active", active)
                .with("idle", window_ms - active),
        );
    }

    events
}

/// Event for one connection count query
pub fn connection_event(tags: &EventTags, count: Result<u64>) -> Event {
    match count {
        Ok(count) => tags
            .gauge(ACTIVE_CONNECTIONS, count)
            .with("count", count),
        Err(e) => tags
            .event(Level::Error, ACTIVE_CONNECTIONS)
            .with("type", MetricType::Gauge.as_str())
            .with("error", e.to_string()),
    }
}

/// Handle to a running reporter
///
/// Dropping the handle aborts every periodic task; [`MetricsReporter::stop`]
/// shuts them down cleanly.
pub struct MetricsReporter {
    config: ReportingConfig,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl MetricsReporter {
    pub fn builder(source: impl Into<String>) -> ReporterBuilder {
        ReporterBuilder::new(source)
    }

    pub fn config(&self) -> &ReportingConfig {
        &self.config
    }

    /// Cancel every periodic task and wait for them to exit
    pub async fn stop(mut self) {
        info!(source = %self.config.source, "Stopping metrics reporter");
        let _ = self.shutdown.send(());
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Builder for creating and starting a [`MetricsReporter`]
pub struct ReporterBuilder {
    config: ReportingConfig,
    emitter: Option<Arc<dyn LogEmitter>>,
    memory: Option<Arc<dyn MemorySource>>,
    connections: Option<Arc<dyn ConnectionCounter>>,
}

impl ReporterBuilder {
    /// Create a builder with default configuration
    pub fn new(source: impl Into<String>) -> Self {
        Self::from_config(ReportingConfig {
            source: source.into(),
            ..Default::default()
        })
    }

    /// Create a builder from a loaded configuration
    pub fn from_config(config: ReportingConfig) -> Self {
        Self {
            config,
            emitter: None,
            memory: None,
            connections: None,
        }
    }

    /// Replace the whole configuration, e.g. one from [`ReportingConfig::load`]
    pub fn config(mut self, config: ReportingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the reporting interval
    pub fn reporting_interval(mut self, interval: Duration) -> Self {
        self.config.reporting_interval = interval;
        self
    }

    /// Set the lag detector's wake-up period
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.config.sample_interval = interval;
        self
    }

    /// Set the single-tick lag that is logged immediately
    pub fn pause_threshold(mut self, threshold: Duration) -> Self {
        self.config.pause_threshold = threshold;
        self
    }

    /// Set the deployment environment tag
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.config.environment = environment.into();
        self
    }

    /// Enable or disable lag percentiles and utilization
    pub fn lag_histogram(mut self, enabled: bool) -> Self {
        self.config.lag_histogram = enabled;
        self
    }

    pub fn title_style(mut self, style: TitleStyle) -> Self {
        self.config.title_style = style;
        self
    }

    /// Set where events are written (default: JSON lines on stderr)
    pub fn emitter(mut self, emitter: Arc<dyn LogEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Set the memory counter source (default: [`ProcessMemory`])
    pub fn memory_source(mut self, memory: Arc<dyn MemorySource>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Also report open connections
    pub fn connections(mut self, counter: Arc<dyn ConnectionCounter>) -> Self {
        self.connections = Some(counter);
        self
    }

    /// Start every periodic task on the current tokio runtime
    pub fn start(self) -> Result<MetricsReporter> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let config = self.config;
        let emitter = self
            .emitter
            .unwrap_or_else(|| Arc::new(JsonLineEmitter::stderr()));
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(ProcessMemory::new()));
        let tags = EventTags::new(config.source.clone(), config.environment.clone());
        let style = config.title_style;
        let period = config.reporting_interval;

        let detector = detector::start(
            DetectorConfig {
                sleep_interval: config.sample_interval,
                pause_threshold: config.pause_threshold,
                histogram: config.lag_histogram,
            },
            emitter.clone(),
            tags.clone(),
        )?;

        info!(
            source = %config.source,
            env = %config.environment,
            reporting_interval_ms = config.reporting_interval.as_secs_f64() * 1000.0,
            sample_interval_ms = config.sample_interval.as_secs_f64() * 1000.0,
            pause_threshold_ms = config.pause_threshold.as_secs_f64() * 1000.0,
            "Starting metrics reporter"
        );

        let anchor = Instant::now();
        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(3);

        {
            let (tags, emitter) = (tags.clone(), emitter.clone());
            let mut warnings = CounterWarnings::default();
            tasks.push(runtime.spawn(every(anchor, period, shutdown.subscribe(), move || {
                for event in memory_events(&tags, style, memory.as_ref(), &mut warnings) {
                    emitter.emit(&event);
                }
                async {}
            })));
        }

        tasks.push(runtime.spawn(report_lag(
            detector,
            anchor,
            period,
            tags.clone(),
            style,
            emitter.clone(),
            shutdown.subscribe(),
        )));

        if let Some(counter) = self.connections {
            tasks.push(runtime.spawn(every(anchor, period, shutdown.subscribe(), move || {
                let (counter, tags, emitter) = (counter.clone(), tags.clone(), emitter.clone());
                async move {
                    let event = connection_event(&tags, counter.connection_count().await);
                    emitter.emit(&event);
                }
            })));
        }

        Ok(MetricsReporter {
            config,
            shutdown,
            tasks,
        })
    }
}

/// Start a reporter writing JSON lines to stderr with the process's own
/// memory counters
pub fn log_metrics(
    source: impl Into<String>,
    reporting_interval: Duration,
    pause_threshold: Duration,
) -> Result<MetricsReporter> {
    ReporterBuilder::new(source)
        .reporting_interval(reporting_interval)
        .pause_threshold(pause_threshold)
        .start()
}

/// Ticker that first fires one full period after `anchor`
fn reporting_ticker(anchor: Instant, period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(anchor + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Run `action` once per period until shutdown
async fn every<F, Fut>(
    anchor: Instant,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut action: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = reporting_ticker(anchor, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => action().await,
            _ = shutdown.recv() => break,
        }
    }
}

/// Flush the detector once per period and report the window
async fn report_lag(
    mut detector: DetectorHandle,
    anchor: Instant,
    period: Duration,
    tags: EventTags,
    style: TitleStyle,
    emitter: Arc<dyn LogEmitter>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = reporting_ticker(anchor, period);
    let mut window_start = anchor;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let aggregated = detector.flush();
                let snapshot = match detector.take_snapshot() {
                    Some(Ok(snapshot)) => Some(snapshot),
                    Some(Err(e)) => {
                        warn!(error = %e, "Lag histogram unavailable this cycle");
                        None
                    }
                    None => None,
                };

                debug!(lag_ms = aggregated.as_millis_f64(), "Flushed scheduler lag");

                for event in lag_events(&tags, style, aggregated, snapshot, now - window_start) {
                    emitter.emit(&event);
                }
                window_start = now;
            }
            _ = shutdown.recv() => {
                detector.stop().await;
                break;
            }
        }
    }
}
