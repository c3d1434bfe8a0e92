use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::WorkerError;

/// Log to stdout and to a `YYYY-MM-DD.log` file in `log_dir`, rotated daily.
///
/// The returned guard flushes the file writer when dropped, keep it alive until exit.
pub fn init(log_dir: &Path) -> Result<WorkerGuard, WorkerError> {
    let file_appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_suffix("log")
        .build(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()?;

    Ok(guard)
}
