//! Error types for the procpulse library

use thiserror::Error;

/// Errors surfaced by procpulse
///
/// None of these are fatal to the host process. Counter and connection
/// failures only mean that a single metric is not reported this cycle.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be loaded from the environment
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Periodic tasks need a running tokio runtime
    #[error("no tokio runtime is running on this thread")]
    NoRuntime,

    /// A process counter could not be read
    #[error("{counter} is unavailable: {reason}")]
    CounterUnavailable {
        counter: &'static str,
        reason: String,
    },

    /// The connection counter failed to produce a value
    #[error("failed to count connections: {0}")]
    ConnectionCount(String),

    /// The lag histogram was read without being re-armed
    #[error("lag histogram is disarmed")]
    HistogramDisarmed,
}

pub type Result<T> = std::result::Result<T, Error>;
