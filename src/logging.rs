use std::path::Path;

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::{AppError, AppResult};

pub const LOG_ENV: &str = "ACCOUNT_MIGRATION_LOG";
pub const DEFAULT_FILTER: &str = "account_migration=info,sqlx=warn";
pub const LOG_FILE_NAME: &str = "account-migration.log";
pub const LOG_FILE_MAX_BYTES: usize = 5 * 1024 * 1024;
pub const LOG_FILE_KEEP: usize = 3;

const ERR_LOGGING_INIT: &str = "LOGGING/INIT";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the JSON subscriber on stderr.
pub fn init_logging() -> AppResult<()> {
    install(None).map(|_| ())
}

/// Install the JSON subscriber on stderr plus a size-rotated file under
/// `log_dir`. Keep the returned guard alive until the process exits so
/// buffered lines are flushed.
pub fn init_file_logging(log_dir: &Path) -> AppResult<WorkerGuard> {
    install(Some(log_dir))?.ok_or_else(|| {
        AppError::new(ERR_LOGGING_INIT, "File logging was not installed.")
            .with_context("path", log_dir.display().to_string())
    })
}

fn install(log_dir: Option<&Path>) -> AppResult<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|err| AppError::io(err, "logging_create_dir", dir))?;
            let rotating = FileRotate::new(
                dir.join(LOG_FILE_NAME),
                AppendCount::new(LOG_FILE_KEEP),
                ContentLimit::Bytes(LOG_FILE_MAX_BYTES),
                Compression::None,
                #[cfg(unix)]
                None,
            );
            let (writer, guard) = tracing_appender::non_blocking(rotating);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(|err| {
        AppError::new(ERR_LOGGING_INIT, "A global tracing subscriber is already installed.")
            .with_cause(AppError::from(err.to_string()))
    })?;
    // Forward `log` records from dependencies into tracing.
    let _ = tracing_log::LogTracer::init();
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        let filter = EnvFilter::new(DEFAULT_FILTER);
        assert!(filter.to_string().contains("account_migration=info"));
    }
}
