//! codecell - sandboxed execution bridge for interactive code cells.
//!
//! Guest code runs in an isolated worker thread with no network capability.
//! The only path to the outside world is a synchronous fetch relay: the
//! worker posts a fetch request to the privileged host and blocks on a
//! fixed-size shared-memory buffer, through which the host streams the
//! response in chunks behind an atomic signal word.
//!
//! Entry point for callers is [`orchestrator::Orchestrator`].

pub mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod interpreter;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod workers;

pub use config::RunnerConfig;
pub use error::{ResultExt, RunnerError};
pub use orchestrator::Orchestrator;
pub use protocol::RunResult;
