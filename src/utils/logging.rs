// src/utils/logging.rs
//! Logging utilities for the server.
//!
//! This module provides functions for initializing the tracing subscriber,
//! either on the console alone or on the console plus a daily rolled file.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// `RUST_LOG` if set, otherwise the given level
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn init_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("Failed to initialize logging: {}", e),
    )
}

/// Initialize the logging system with console output
pub fn init_logging(log_level: &str) -> io::Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_thread_names(true)
        .with_writer(io::stdout);

    tracing_subscriber::registry()
        .with(console_layer.with_filter(env_filter(log_level)))
        .try_init()
        .map_err(init_error)?;

    Ok(())
}

/// Log to a daily rolled file in addition to the console.
///
/// The returned guard flushes the file writer when dropped and must be held
/// for as long as the server runs.
pub fn init_file_logging(log_level: &str, log_file: &str) -> io::Result<WorkerGuard> {
    let log_path = Path::new(log_file);
    let log_dir = match log_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = log_path
        .file_name()
        .unwrap_or_else(|| OsStr::new("tunnel-server.log"));

    let file_appender = rolling::daily(log_dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_thread_names(true)
        .with_writer(writer)
        .with_ansi(false);

    let console_layer = fmt::layer().with_writer(io::stdout).with_ansi(true);

    tracing_subscriber::registry()
        .with(file_layer.with_filter(env_filter(log_level)))
        .with(console_layer.with_filter(env_filter(log_level)))
        .try_init()
        .map_err(init_error)?;

    Ok(guard)
}
