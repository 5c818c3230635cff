//! provides logging helpers

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Log file used when no path is passed to [`init`].
pub const LOG_PATH_ENV_VAR: &str = "MEMMAN_LOG_PATH";

/// Formatting layer writing to a daily rotated file at `log_path`, or to
/// stderr when no path is given. Log lines are flushed until the returned
/// guard is dropped.
pub fn get_fmt_layer<S>(log_path: Option<&Path>) -> anyhow::Result<(impl Layer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let (writer, guard) = match log_path {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|name| name.to_str())
                .with_context(|| format!("invalid log file path {}", path.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(dir)
                .context("failed to create rolling file appender")?;
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let fmt_layer = layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(log_path.is_none());
    Ok((fmt_layer, guard))
}

/// initiate the global tracing subscriber
pub fn init(log_path: Option<&Path>) -> anyhow::Result<WorkerGuard> {
    let log_path = log_path
        .map(Path::to_path_buf)
        .or_else(|| env::var_os(LOG_PATH_ENV_VAR).map(PathBuf::from));
    let (fmt_layer, guard) = get_fmt_layer(log_path.as_deref())?;

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .context("failed to install global tracing subscriber")?;
    Ok(guard)
}
