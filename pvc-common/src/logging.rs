//! Logging initialization for the PVC daemons.
//!
//! Console output is a compact human-readable layer; an optional JSON
//! file layer is available for log aggregation. Filtering follows
//! `RUST_LOG` when set, otherwise the level passed on the command line.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging with console output.
///
/// # Example
/// ```
/// pvc_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// Initialize logging with JSON output written to a file, alongside the
/// console layer. Suitable for nodes shipping logs to an aggregator.
pub fn init_logging_json<P: AsRef<Path>>(level: &str, json_path: P) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(json_path.as_ref())
        .with_context(|| format!("failed to open log file: {}", json_path.as_ref().display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string())),
        )
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_writer(file),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    Ok(())
}
