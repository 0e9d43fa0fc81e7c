//! procpulse agent - reports this process's own health signals
//!
//! Runs a metrics reporter against its own process until Ctrl-C. Useful as
//! a smoke test of a configuration before embedding the library.

use anyhow::Result;
use procpulse::{ProcessMemory, ReporterBuilder, ReportingConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Heap counters are read from jemalloc's stats
#[cfg(all(unix, feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go through tracing as JSON; metric lines go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting procpulse-agent");

    let config = ReportingConfig::load()?;
    info!(
        source = %config.source,
        env = %config.environment,
        "Agent configured"
    );

    let reporter = ReporterBuilder::from_config(config)
        .memory_source(Arc::new(ProcessMemory::new()))
        .start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    reporter.stop().await;

    Ok(())
}
