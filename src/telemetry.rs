//! Structured logging setup, following `daemon/serve.rs::init_tracing`'s
//! shape: an `EnvFilter`-gated stderr layer plus an optional JSON file layer,
//! generalized to take a plain `Path` instead of a `Layout` type that also
//! resolves config/data directories this crate has no opinion about.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber. Returns a [`WorkerGuard`] that
/// must be held for the process lifetime when `log_dir` is `Some` — dropping
/// it flushes and stops the non-blocking file writer.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();

    let stderr_layer =
        fmt::layer().with_target(true).with_file(true).with_line_number(true).with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let file_appender = rolling::hourly(dir, "mcp-funnel.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_writer(file_writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(env_filter).with(stderr_layer).with(file_layer).init();

    Ok(guard)
}
