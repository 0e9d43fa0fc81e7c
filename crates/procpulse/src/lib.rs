//! Process health sampling for long-running async services
//!
//! This crate provides:
//! - Scheduler lag detection (pause detection) on the tokio runtime
//! - Memory counters (resident set, heap used, heap total)
//! - Open connection counting
//! - A reporter that emits all of the above as structured log lines

pub mod clock;
pub mod config;
pub mod connections;
pub mod detector;
pub mod emitter;
pub mod error;
pub mod memory;
pub mod reporter;

pub use config::{ReportingConfig, TitleStyle};
pub use connections::{ConnectionCounter, ConnectionGuard, ConnectionTracker};
pub use detector::{DetectorConfig, DetectorHandle, LagSample, LagSnapshot};
pub use emitter::{Event, EventTags, JsonLineEmitter, Level, LogEmitter, MetricType, TracingEmitter};
pub use error::{Error, Result};
pub use memory::{MemorySource, ProcessMemory};
pub use reporter::{log_metrics, MetricsReporter, ReporterBuilder};
