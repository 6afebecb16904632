//! Structured logging for the downloader
//!
//! This module provides functionality for:
//! 1. Filtering by the configured level, with `RUST_LOG` taking precedence
//! 2. Writing compact lines to the terminal
//! 3. Writing logs to a daily rotating file in JSON or line format

use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

use crate::danbooru::config::Logging;

/// File name prefix of the rotating log file.
const LOG_FILE_NAME: &str = "danbooru_downloader.log";

/// Error types for logging
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for logging operations
pub type LoggerResult<T> = Result<T, LoggerError>;

/// Builds the env filter, falling back to the configured level.
fn build_filter(level: &str) -> LoggerResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LoggerError::Logging(e.to_string()))
}

/// Installs the global subscriber.
///
/// The returned guard must be held for the life of the program, otherwise
/// buffered file output is lost.
pub fn init_logger(config: &Logging) -> LoggerResult<Option<WorkerGuard>> {
    let filter = build_filter(&config.log_level)?;

    let terminal_layer = config.log_to_terminal.then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let mut guard = None;
    let file_layer = if config.log_to_file {
        let log_dir = Path::new(&config.log_directory);
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let layer = match config.log_format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
            _ => fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_span_events(FmtSpan::CLOSE)
                .boxed(),
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::Logging(e.to_string()))?;

    info!(
        log_format = %config.log_format,
        log_level = %config.log_level,
        "Logger initialized"
    );

    Ok(guard)
}
