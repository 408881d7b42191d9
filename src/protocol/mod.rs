//! JSONL control protocol between the host orchestrator and the worker.
//!
//! Messages are exchanged as newline-delimited JSON (JSONL), each tagged by a
//! `type` field. The protocol is deliberately small:
//!
//! - `run` (host → worker): the caller-supplied code for one run
//! - `fetch` (worker → host): one guest network call; the shared buffer that
//!   carries the response travels out-of-band alongside the message
//! - `run-done` (worker → host): the terminal [`RunResult`], exactly once
//!
//! The fetch *response* never appears here - it moves through the shared
//! buffer in chunks (see [`crate::bridge`]).
//!
//! # Module Structure
//!
//! - `message`: the `Message` enum and the run/result data model
//! - `io`: JSONL parsing with graceful error handling, serialization,
//!   streaming reader

mod io;
mod message;

pub use io::*;
pub use message::*;
