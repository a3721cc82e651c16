//! Log sinks
//!
//! Foreground runs log to stderr. Otherwise records go to a daily rolling
//! file through a non-blocking writer; the returned guard flushes it on drop
//! and has to live as long as the process.

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FILE_PREFIX: &str = "gpsstatsd.log";

pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// `-d` forces debug; otherwise `RUST_LOG`, defaulting to info
pub fn filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logging(debug: bool, foreground: bool, log_dir: &Path) -> io::Result<LoggingGuard> {
    if foreground {
        tracing_subscriber::registry()
            .with(filter(debug))
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
        return Ok(LoggingGuard { _file_guard: None });
    }

    fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter(debug))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();

    Ok(LoggingGuard {
        _file_guard: Some(guard),
    })
}
