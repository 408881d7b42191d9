use thiserror::Error;
use tracing::{error, warn};

/// Error severity for caller-facing reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning,  // Recoverable, run may still produce a result
    Error,    // Run failed
    Critical, // Runner itself is in a bad state
}

/// Domain-specific errors for the code-cell runner.
///
/// Everything that prevents a `run-done` message from arriving surfaces as
/// one of these; errors raised by guest code itself fold into the Error
/// variant of `RunResult` instead.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Interpreter initialization failed: {0}")]
    Initialization(String),

    #[error("Fetch transport failed: {0}")]
    FetchTransport(String),

    #[error("Fetch timed out after {timeout_ms}ms")]
    FetchTimeout { timeout_ms: u64 },

    #[error("Run exceeded the {timeout_ms}ms limit and the worker was abandoned")]
    RunTimeout { timeout_ms: u64 },

    #[error("Bridge protocol violation: {0}")]
    Protocol(String),

    #[error("Worker exited without reporting a result: {0}")]
    WorkerCrashed(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Failed to parse protocol message: {0}")]
    ProtocolParse(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Initialization(_) => ErrorSeverity::Error,
            Self::FetchTransport(_) => ErrorSeverity::Error,
            Self::FetchTimeout { .. } => ErrorSeverity::Error,
            Self::RunTimeout { .. } => ErrorSeverity::Error,
            Self::Protocol(_) => ErrorSeverity::Critical,
            Self::WorkerCrashed(_) => ErrorSeverity::Critical,
            Self::Spawn(_) => ErrorSeverity::Error,
            Self::ProtocolParse(_) => ErrorSeverity::Warning,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Initialization(msg) => format!("The interpreter failed to start: {}", msg),
            Self::FetchTransport(msg) => format!("Network request failed: {}", msg),
            Self::FetchTimeout { timeout_ms } => {
                format!("Network request timed out after {}ms", timeout_ms)
            }
            Self::RunTimeout { timeout_ms } => {
                format!("Execution timed out after {}ms", timeout_ms)
            }
            Self::Protocol(msg) => format!("Internal protocol error: {}", msg),
            Self::WorkerCrashed(msg) => format!("Execution worker crashed: {}", msg),
            Self::Spawn(msg) => format!("Could not start execution worker: {}", msg),
            Self::ProtocolParse(e) => format!("Invalid message format: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Extension trait for silent error logging with caller location tracking.
/// Use when the operation is recoverable and the run should continue.
pub trait ResultExt<T> {
    /// Log error with caller location and return None. Use for recoverable failures.
    fn log_err(self) -> Option<T>;
    /// Log as warning with caller location and return None. Use for expected failures.
    fn warn_on_err(self) -> Option<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                error!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation failed"
                );
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                warn!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation had warning"
                );
                None
            }
        }
    }
}

/// Panic in debug mode, log error in release mode.
///
/// Use for "impossible" states that should crash during development
/// but gracefully degrade in production.
#[macro_export]
macro_rules! debug_panic {
    ( $($fmt_arg:tt)* ) => {
        if cfg!(debug_assertions) {
            panic!( $($fmt_arg)* );
        } else {
            tracing::error!("IMPOSSIBLE STATE: {}", format_args!($($fmt_arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            RunnerError::Protocol("bad signal".into()).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            RunnerError::FetchTimeout { timeout_ms: 10_000 }.severity(),
            ErrorSeverity::Error
        );
    }

    #[test]
    fn test_user_message_labels_timeouts() {
        let err = RunnerError::RunTimeout { timeout_ms: 120_000 };
        assert!(err.user_message().contains("120000ms"));

        let err = RunnerError::FetchTimeout { timeout_ms: 10_000 };
        assert!(err.to_string().contains("10000ms"));
    }

    #[test]
    fn test_result_ext_returns_none_on_err() {
        let result: std::result::Result<(), &str> = Err("nope");
        assert!(result.log_err().is_none());

        let result: std::result::Result<u32, &str> = Ok(7);
        assert_eq!(result.warn_on_err(), Some(7));
    }
}
