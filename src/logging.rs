//! Structured JSONL logging for agents and human-readable stderr output.
//!
//! Dual-output logging:
//! - **JSONL to file** (~/.codecell/logs/codecell.jsonl) - structured for machine parsing
//! - **Pretty to stderr** - human-readable for developers
//!
//! # Usage
//!
//! ```rust,ignore
//! use codecell::logging;
//!
//! // Initialize logging - MUST keep guard alive for duration of program
//! let _guard = logging::init();
//!
//! tracing::info!(event_type = "run_start", "Run started");
//! ```

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Guard that must be kept alive for the duration of the program.
/// Dropping this guard will flush and close the log file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the dual-output logging system.
///
/// Returns a guard that MUST be kept alive for the duration of the program.
/// Dropping the guard will flush remaining logs and close the file.
pub fn init() -> LoggingGuard {
    let log_dir = get_log_dir();
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("[LOGGING] Failed to create log directory: {}", e);
    }

    let log_path = log_dir.join("codecell.jsonl");

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .unwrap_or_else(|e| {
            eprintln!("[LOGGING] Failed to open log file: {}", e);
            OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .expect("Failed to open /dev/null")
        });

    // Non-blocking writer keeps the bridge poll loops off the disk
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file);

    // Environment filter - default to info, allow override via RUST_LOG
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ureq=warn,rustls=warn"));

    // JSONL layer for file output
    let json_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE);

    // Pretty layer for stderr
    let pretty_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    tracing::info!(
        event_type = "runner_lifecycle",
        action = "started",
        log_path = %log_path.display(),
        "Runner logging initialized"
    );

    LoggingGuard {
        _file_guard: file_guard,
    }
}

/// Get the log directory path (~/.codecell/logs/)
fn get_log_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".codecell").join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join("codecell-logs"))
}

/// Get the path to the JSONL log file
pub fn log_path() -> PathBuf {
    get_log_dir().join("codecell.jsonl")
}

/// Log a run lifecycle event with structured fields
pub fn log_run_event(run_id: &str, action: &str, duration_ms: Option<u64>, success: bool) {
    match duration_ms {
        Some(duration) => {
            tracing::info!(
                event_type = "run_event",
                run_id = run_id,
                action = action,
                duration_ms = duration,
                success = success,
                "Run {} {}",
                action,
                run_id
            );
        }
        None => {
            tracing::info!(
                event_type = "run_event",
                run_id = run_id,
                action = action,
                success = success,
                "Run {} {}",
                action,
                run_id
            );
        }
    }
}

/// Log a bridge transfer event with structured fields
pub fn log_bridge_event(run_id: &str, action: &str, bytes: usize, chunks: usize) {
    tracing::debug!(
        event_type = "bridge_event",
        run_id = run_id,
        action = action,
        bytes = bytes,
        chunks = chunks,
        "Bridge {} ({} bytes, {} chunks)",
        action,
        bytes,
        chunks
    );
}
