use anyhow::{Context, Result};
use std::{fs, path::Path};
use tracing::{info, level_filters::LevelFilter};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "RIGSMITH_LOG";
pub const LOG_FILE_NAME: &str = "rigsmith.log";

/// Installs the global subscriber: everything the filter allows goes to
/// `<data_dir>/rigsmith.log`, stderr only shows warnings unless `verbose`.
/// Keep the returned guard alive until exit so the file writer flushes.
pub fn init(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(data_dir).context("create data dir")?;
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let appender = tracing_appender::rolling::never(data_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    let stderr_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_level);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("install log subscriber")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "RigSmith starting"
    );
    Ok(guard)
}
