//! Logging setup.
//!
//! The library only emits `tracing` events; embedding applications either
//! install their own subscriber or call `init_tracing` once at startup.

use std::fs;

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::settings::data_directory;

const LOG_FILE_PREFIX: &str = "dbbridge.log";
const DEFAULT_FILTER: &str = "dbbridge=info";

/// Installs a daily rolling file subscriber under `<data dir>/logs`.
///
/// `RUST_LOG` overrides the default filter. Does nothing if a global
/// subscriber is already set.
pub fn init_tracing() {
    let log_dir = data_directory().join("logs");
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("dbbridge: cannot create log directory {}: {}", log_dir.display(), err);
        return;
    }

    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(file_appender)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}
