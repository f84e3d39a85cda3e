//! Logging setup with a reloadable filter.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Plain or JSON console output
//! - Optional daily-rolling log files with retention cleanup
//! - Local timezone timestamps for logs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "notify_hub=info,reqwest=warn";

/// File name prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "notify-hub.log";

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// How logging should be installed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Emit console logs as JSON lines.
    pub console_json: bool,
    /// Directory for daily-rolling log files. `None` disables file output.
    pub log_dir: Option<PathBuf>,
    /// Initial filter. `RUST_LOG` wins, then this, then [`DEFAULT_LOG_FILTER`].
    pub filter: Option<String>,
}

/// Runtime control over the installed subscriber.
pub struct LoggingHandle {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Set a new filter directive, e.g. `notify_hub=debug,reqwest=warn`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Delete rolled log files older than `retention_days`.
    pub async fn cleanup_old_logs(&self, retention_days: i64) -> Result<usize> {
        match &self.log_dir {
            Some(dir) => cleanup_old_logs(dir, retention_days)
                .await
                .map_err(|e| Error::Other(format!("Failed to clean up logs: {}", e))),
            None => Ok(0),
        }
    }
}

/// Delete log files older than the specified number of days.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff_ts = (Utc::now() - chrono::Duration::days(retention_days)).timestamp();
    let prefix = format!("{}.", LOG_FILE_PREFIX);

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        // notify-hub.log.YYYY-MM-DD
        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix.as_str()))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        let file_ts = file_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);

        if file_ts < cutoff_ts {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            } else {
                deleted_count += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

fn initial_filter(options: &LoggingOptions) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        options
            .filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    })
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_logging(
    options: &LoggingOptions,
) -> Result<(Arc<LoggingHandle>, Option<WorkerGuard>)> {
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter(options));

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::config(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (plain_console, json_console) = if options.console_json {
        (None, Some(fmt::layer().json().with_timer(LocalTimer)))
    } else {
        (Some(fmt::layer().with_ansi(true).with_timer(LocalTimer)), None)
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(plain_console)
        .with(json_console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    let handle = Arc::new(LoggingHandle {
        handle: filter_handle,
        log_dir: options.log_dir.clone(),
    });

    Ok((handle, guard))
}
