//! Reporter configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable holding the deployment environment name
pub const DEPLOY_ENV_VAR: &str = "DEPLOY_ENV";

/// Environment name used when `DEPLOY_ENV` is not set
pub const DEFAULT_ENVIRONMENT: &str = "staging";

/// Prefix of the configuration environment variables
const ENV_PREFIX: &str = "PROCPULSE";

/// Naming scheme for memory and aggregated-lag event titles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleStyle {
    /// `HeapUsed`, `HeapTotal`, `RSS`, `PauseMetric`
    Classic,
    /// `heap-used`, `heap-total`, `rss`, `aggregated-lag`
    #[default]
    Kebab,
}

impl TitleStyle {
    pub fn heap_used(self) -> &'static str {
        match self {
            TitleStyle::Classic => "HeapUsed",
            TitleStyle::Kebab => "heap-used",
        }
    }

    pub fn heap_total(self) -> &'static str {
        match self {
            TitleStyle::Classic => "HeapTotal",
            TitleStyle::Kebab => "heap-total",
        }
    }

    pub fn rss(self) -> &'static str {
        match self {
            TitleStyle::Classic => "RSS",
            TitleStyle::Kebab => "rss",
        }
    }

    pub fn aggregated_lag(self) -> &'static str {
        match self {
            TitleStyle::Classic => "PauseMetric",
            TitleStyle::Kebab => "aggregated-lag",
        }
    }
}

/// Reporter configuration, fixed once the reporter starts
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReportingConfig {
    /// Logical name of the reporting process
    #[serde(default = "default_source")]
    pub source: String,

    /// Deployment environment tag
    #[serde(default = "default_environment")]
    pub environment: String,

    /// How often memory, lag and connection metrics are emitted
    #[serde(
        rename = "reporting_interval_ms",
        default = "default_reporting_interval",
        deserialize_with = "millis"
    )]
    pub reporting_interval: Duration,

    /// Wake-up period of the lag detector
    #[serde(
        rename = "sample_interval_ms",
        default = "default_sample_interval",
        deserialize_with = "millis"
    )]
    pub sample_interval: Duration,

    /// Single-tick lag that is logged immediately as a pause
    #[serde(
        rename = "pause_threshold_ms",
        default = "default_pause_threshold",
        deserialize_with = "millis"
    )]
    pub pause_threshold: Duration,

    /// Emit event-loop-lag percentiles and utilization
    #[serde(default = "default_lag_histogram")]
    pub lag_histogram: bool,

    #[serde(default)]
    pub title_style: TitleStyle,
}

fn default_source() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

/// Deployment environment from `DEPLOY_ENV`, or `"staging"`
pub fn default_environment() -> String {
    std::env::var(DEPLOY_ENV_VAR).unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
}

fn default_reporting_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_pause_threshold() -> Duration {
    Duration::from_millis(1000)
}

/// Durations are configured as whole milliseconds
fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn default_lag_histogram() -> bool {
    true
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            environment: default_environment(),
            reporting_interval: default_reporting_interval(),
            sample_interval: default_sample_interval(),
            pause_threshold: default_pause_threshold(),
            lag_histogram: default_lag_histogram(),
            title_style: TitleStyle::default(),
        }
    }
}

impl ReportingConfig {
    /// Load configuration from `PROCPULSE_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_source(None)
    }

    /// Load configuration from an explicit variable map instead of the
    /// process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::from_source(Some(vars))
    }

    fn from_source(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reporting_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "reporting interval must be greater than zero".to_string(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sample interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
