//! Logging configuration for dune-poll.
//!
//! Logs go to stderr so that previews printed on stdout stay clean, or to a
//! file when `--log-file` is given.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Builds the filter from `RUST_LOG`, falling back to `info` (or `debug`
/// when verbose).
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(verbose)))
}

fn default_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Initializes logging to stderr.
pub fn init_stderr_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .init();
}

/// Initializes logging appended to `path`.
///
/// Falls back to stderr logging if the file cannot be opened.
pub fn init_file_logging(path: &Path, verbose: bool) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            init_stderr_logging(verbose);
            return;
        }
    }

    let log_file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {}: {e}", path.display());
            init_stderr_logging(verbose);
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .init();
}

/// Initializes logging for the given CLI flags.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) {
    match log_file {
        Some(path) => init_file_logging(path, verbose),
        None => init_stderr_logging(verbose),
    }
}
