//! Tracing setup for the answer server.
//!
//! Every event goes to stdout and to the file named in [`LogSettings`]. HTTP requests
//! run inside [`request_span`] and generated sections inside [`section_span`], so a
//! streamed answer can be followed through the file by its request id.

use crate::config::LogSettings;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{Span, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, filter::ParseError, fmt, prelude::*};

/// Failures while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// `RUST_LOG` held directives `EnvFilter` could not parse.
    #[error("Invalid log filter {filter:?}: {source}")]
    Filter {
        /// Directives as configured.
        filter: String,
        /// Parser failure.
        source: ParseError,
    },
    /// The log file or its directory could not be opened.
    #[error("Failed to open log file {path}: {source}")]
    File {
        /// Configured log file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Another global subscriber is already installed.
    #[error("Tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install the stdout and file subscriber.
///
/// The returned guard flushes the file writer when dropped; keep it alive for the
/// lifetime of the process.
pub fn init_tracing(settings: &LogSettings) -> Result<WorkerGuard, LoggingError> {
    let (subscriber, guard) = build_subscriber(settings)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|error| LoggingError::AlreadyInstalled(error.to_string()))?;
    Ok(guard)
}

/// Span wrapping one HTTP request.
pub fn request_span(request_id: &str, method: &str, path: &str) -> Span {
    tracing::info_span!("http_request", request_id = %request_id, method = %method, path = %path)
}

/// Span wrapping one section's model invocation and relay.
pub fn section_span(section: &str, passages: usize) -> Span {
    tracing::info_span!("section", section = %section, passages)
}

fn build_subscriber(
    settings: &LogSettings,
) -> Result<(impl Subscriber + Send + Sync + 'static, WorkerGuard), LoggingError> {
    let filter = EnvFilter::try_new(&settings.filter).map_err(|source| LoggingError::Filter {
        filter: settings.filter.clone(),
        source,
    })?;

    let file = open_log_file(&settings.file)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact(),
        );
    Ok((subscriber, guard))
}

fn open_log_file(path: &Path) -> Result<fs::File, LoggingError> {
    let file_error = |source| LoggingError::File {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(file_error)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(file_error)
}
