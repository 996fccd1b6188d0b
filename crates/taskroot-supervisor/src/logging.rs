//! Process-wide `tracing` subscriber setup.
//!
//! Environment variables read by [`init_logging`]:
//!   LOG_FORMAT  - "json" or "text" (default: "text")
//!   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
//!   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
//!   RUST_LOG    - standard env filter
//!
//! Children always log JSON lines to stdout so the supervisor can forward
//! them; see [`init_child_logging`].

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskroot_core::{Error, Result};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str =
    "taskroot=info,taskroot_db=info,taskroot_rpc=info,taskroot_beat=info,taskroot_supervisor=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

fn already_set(e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("Failed to install tracing subscriber: {}", e))
}

/// Install the subscriber of the owning process.
///
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let registry = tracing_subscriber::registry().with(env_filter());

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("taskroot.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .try_init()
                .map_err(already_set)?;
        } else {
            // no ANSI in files unless asked for
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).try_init().map_err(already_set)?;
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(already_set)?;
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).try_init().map_err(already_set)?;
        }
        None
    };

    info!(
        subsystem = "supervisor",
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    Ok(guard)
}

/// Install the JSON-to-stdout subscriber of a supervised child.
pub fn init_child_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(std::io::stdout),
        )
        .try_init()
        .map_err(already_set)
}
