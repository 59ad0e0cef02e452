//! Structured logging for fanout.
//!
//! Log levels:
//! - ERROR: Coordinator invariants broken, persistence failures
//! - WARN: Task failures, dispatch retries, cancelled runs
//! - INFO: Orchestration lifecycle (start, dispatch, completion, finalize)
//! - DEBUG: Conflict detection, resolution, event fan-out
//! - TRACE: Runner output and per-event detail
//!
//! Debug mode can be enabled with `--debug` flag or `FANOUT_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Initialize logging with explicit debug mode and an optional log file.
///
/// The log file is truncated on startup. Calling this twice is harmless;
/// the first subscriber stays installed.
pub fn init_with_debug(debug: bool, log_file: Option<&Path>) {
    let debug_enabled = debug || env_debug();

    let fallback = if debug_enabled { "fanout=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
        {
            Ok(f) => Some(f),
            Err(err) => {
                eprintln!("failed to open log file '{}': {}", path.display(), err);
                None
            }
        }
    });

    match file {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }

    tracing::debug!(
        debug = debug_enabled,
        log_file = log_file.map(|p| p.display().to_string()).as_deref().unwrap_or("(stderr)"),
        "logging initialized"
    );
}

fn env_debug() -> bool {
    std::env::var("FANOUT_DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
