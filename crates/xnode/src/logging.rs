//! Configure the `tracing` subscriber.

use anyhow::Context as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::fmt;

use crate::cfg::LoggingConfig;

/// Name of the file (before the date suffix) in the log directory.
const LOG_FILE_PREFIX: &str = "xnode.log";

/// Parse `directives` as a filter.
pub(crate) fn filter(directives: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(directives)
}

/// Install the global subscriber.
///
/// The filter is the first of: `level` (from the command line), the
/// `RUST_LOG` environment variable, and the configured console filter.
///
/// Messages written to the log directory are flushed by a background
/// thread, which stops when the returned guard is dropped.
pub(crate) fn setup(
    config: &LoggingConfig,
    level: Option<&str>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = match level {
        Some(level) => filter(level).with_context(|| format!("bad log level {:?}", level))?,
        None => match EnvFilter::try_from_default_env() {
            Ok(f) => f,
            Err(_) => filter(config.console())
                .with_context(|| format!("bad log filter {:?}", config.console()))?,
        },
    };

    let (file_layer, guard) = match config.log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("unable to install log subscriber")?;
    Ok(guard)
}
