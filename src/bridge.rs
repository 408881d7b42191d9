//! Shared-memory bridge between the host and worker contexts.
//!
//! Moves one fetch response (or error text) from the host producer to the
//! worker consumer through a fixed-capacity data region, one chunk at a time.
//! Neither side has a native cross-context blocking wait, so both sides run
//! bounded poll-with-sleep loops against a single atomic signal word:
//!
//! - `0` idle: producer may write the next chunk
//! - `2` chunk ready: consumer drains, then resets to `0`
//! - `1` transfer complete: consumer returns the assembled payload
//! - `-1` error: data region holds a UTF-8 error message
//!
//! The signal word is the only readiness indicator. The data region is never
//! touched unless the signal word grants the current side access, which is
//! what makes the single mutex uncontended in practice: exactly one producer
//! and one consumer exist per buffer, and a buffer serves exactly one fetch.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RunnerError};

/// Producer may write the next chunk
pub const SIGNAL_IDLE: i32 = 0;
/// Transfer complete, payload fully delivered
pub const SIGNAL_DONE: i32 = 1;
/// A chunk is ready for the consumer
pub const SIGNAL_CHUNK_READY: i32 = 2;
/// Transfer failed, data region holds the error message
pub const SIGNAL_ERROR: i32 = -1;

/// Marker appended when an error message exceeds the data region
const TRUNCATION_MARKER: &str = "...[truncated]";

/// Fixed-size shared region for one fetch response.
///
/// Allocated fresh per fetch and never reused; stale-state bugs from buffer
/// reuse are ruled out by construction.
pub struct SharedBuffer {
    signal: AtomicI32,
    /// Length of the valid prefix of the data region for the current chunk
    chunk_len: AtomicUsize,
    data: Mutex<Box<[u8]>>,
    capacity: usize,
}

impl SharedBuffer {
    /// Create a buffer with the given data-region capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "shared buffer capacity must be non-zero");
        SharedBuffer {
            signal: AtomicI32::new(SIGNAL_IDLE),
            chunk_len: AtomicUsize::new(0),
            data: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current signal word value. Exposed for protocol tests.
    pub fn signal(&self) -> i32 {
        self.signal.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Producer side (host orchestrator)
    // ------------------------------------------------------------------

    /// Write the full payload in sequential chunks, then mark success.
    ///
    /// Before every write the producer poll-waits for the consumer to reset
    /// the signal word to idle, so an undrained chunk is never overwritten.
    /// The wait is bounded by `ack_timeout`; a consumer that stops draining
    /// is a protocol error, not a hang.
    ///
    /// Returns the number of chunks written.
    pub fn push_payload(
        &self,
        payload: &[u8],
        ack_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<usize> {
        let mut chunks_written = 0usize;

        for chunk in payload.chunks(self.capacity) {
            self.wait_for_idle(ack_timeout, poll_interval)?;
            {
                let mut data = self.data.lock();
                data[..chunk.len()].copy_from_slice(chunk);
            }
            self.chunk_len.store(chunk.len(), Ordering::Release);
            self.signal.store(SIGNAL_CHUNK_READY, Ordering::Release);
            chunks_written += 1;
        }

        // The final transition also requires the consumer's ack for the last
        // chunk, otherwise DONE would clobber an unread CHUNK_READY.
        self.wait_for_idle(ack_timeout, poll_interval)?;
        self.signal.store(SIGNAL_DONE, Ordering::Release);

        debug!(
            bytes = payload.len(),
            chunks = chunks_written,
            "Payload pushed through shared buffer"
        );
        Ok(chunks_written)
    }

    /// Write an error message and mark the transfer failed.
    ///
    /// Messages longer than the data region are truncated with an explicit
    /// marker and a warning; silently losing the tail would make transport
    /// failures undiagnosable.
    pub fn push_error(
        &self,
        message: &str,
        ack_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let bytes = message.as_bytes();
        let written = if bytes.len() <= self.capacity {
            message.to_string()
        } else {
            warn!(
                message_len = bytes.len(),
                capacity = self.capacity,
                "Error message exceeds shared buffer capacity, truncating"
            );
            let budget = self.capacity.saturating_sub(TRUNCATION_MARKER.len());
            let mut cut = budget;
            while cut > 0 && !message.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}{}", &message[..cut], TRUNCATION_MARKER)
        };

        self.wait_for_idle(ack_timeout, poll_interval)?;
        {
            let mut data = self.data.lock();
            data[..written.len()].copy_from_slice(written.as_bytes());
        }
        self.chunk_len.store(written.len(), Ordering::Release);
        self.signal.store(SIGNAL_ERROR, Ordering::Release);
        Ok(())
    }

    fn wait_for_idle(&self, timeout: Duration, poll_interval: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.signal.load(Ordering::Acquire) {
                SIGNAL_IDLE => return Ok(()),
                SIGNAL_CHUNK_READY => {
                    if Instant::now() >= deadline {
                        return Err(RunnerError::Protocol(format!(
                            "consumer did not drain chunk within {}ms",
                            timeout.as_millis()
                        )));
                    }
                    std::thread::sleep(poll_interval);
                }
                other => {
                    // DONE/ERROR are terminal; the producer alone sets them,
                    // so observing one here means a second producer or reuse.
                    return Err(RunnerError::Protocol(format!(
                        "producer observed unexpected signal word {}",
                        other
                    )));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Consumer side (interpreter engine)
    // ------------------------------------------------------------------

    /// Block (poll-with-sleep) until the transfer completes, assembling
    /// chunks as they arrive.
    ///
    /// Raises [`RunnerError::FetchTimeout`] if neither success nor error is
    /// observed within `timeout`; the guest call site must never hang
    /// indefinitely.
    pub fn await_payload(&self, timeout: Duration, poll_interval: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut assembled: Vec<u8> = Vec::new();

        loop {
            match self.signal.load(Ordering::Acquire) {
                SIGNAL_IDLE => {
                    if Instant::now() >= deadline {
                        return Err(RunnerError::FetchTimeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(poll_interval);
                }
                SIGNAL_CHUNK_READY => {
                    let len = self.chunk_len.load(Ordering::Acquire);
                    {
                        let data = self.data.lock();
                        assembled.extend_from_slice(&data[..len]);
                    }
                    // Reset only after fully draining, releasing the region
                    // back to the producer for the next chunk.
                    self.signal.store(SIGNAL_IDLE, Ordering::Release);
                }
                SIGNAL_DONE => {
                    debug!(bytes = assembled.len(), "Payload assembled from shared buffer");
                    return Ok(assembled);
                }
                SIGNAL_ERROR => {
                    let len = self.chunk_len.load(Ordering::Acquire);
                    let message = {
                        let data = self.data.lock();
                        String::from_utf8_lossy(&data[..len]).into_owned()
                    };
                    return Err(RunnerError::FetchTransport(message));
                }
                other => {
                    return Err(RunnerError::Protocol(format!(
                        "consumer observed unexpected signal word {}",
                        other
                    )));
                }
            }
        }
    }

    /// Force the signal word to an arbitrary value. Test-only escape hatch
    /// for exercising the protocol-error paths.
    #[cfg(test)]
    fn poison_signal(&self, value: i32) {
        self.signal.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const ACK_TIMEOUT: Duration = Duration::from_secs(2);
    const POLL: Duration = Duration::from_millis(1);

    /// Run a producer on a second thread and consume on this one.
    fn round_trip(payload: Vec<u8>, capacity: usize) -> (Vec<u8>, usize) {
        let buffer = Arc::new(SharedBuffer::new(capacity));
        let producer_buffer = buffer.clone();
        let producer_payload = payload.clone();

        let producer = std::thread::spawn(move || {
            producer_buffer
                .push_payload(&producer_payload, ACK_TIMEOUT, POLL)
                .unwrap()
        });

        let assembled = buffer.await_payload(ACK_TIMEOUT, POLL).unwrap();
        let chunks = producer.join().unwrap();
        (assembled, chunks)
    }

    fn patterned(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let (assembled, chunks) = round_trip(Vec::new(), 8);
        assert!(assembled.is_empty());
        assert_eq!(chunks, 0);
    }

    #[test]
    fn test_round_trip_smaller_than_capacity() {
        let payload = patterned(3);
        let (assembled, chunks) = round_trip(payload.clone(), 8);
        assert_eq!(assembled, payload);
        assert_eq!(chunks, 1);
    }

    #[test]
    fn test_round_trip_exactly_capacity() {
        let payload = patterned(8);
        let (assembled, chunks) = round_trip(payload.clone(), 8);
        assert_eq!(assembled, payload);
        assert_eq!(chunks, 1);
    }

    #[test]
    fn test_round_trip_multiple_of_capacity() {
        let payload = patterned(24);
        let (assembled, chunks) = round_trip(payload.clone(), 8);
        assert_eq!(assembled, payload);
        assert_eq!(chunks, 3);
    }

    #[test]
    fn test_round_trip_much_larger_than_capacity() {
        let payload = patterned(10_000);
        let (assembled, chunks) = round_trip(payload.clone(), 64);
        assert_eq!(assembled, payload);
        // ceil(10000 / 64)
        assert_eq!(chunks, 157);
    }

    #[test]
    fn test_back_pressure_each_chunk_seen_exactly_once_in_order() {
        // Chunks carry distinct sequence numbers; a hand-rolled slow consumer
        // records every chunk it drains. An overwrite or replay would break
        // either the sequence or the reassembled payload.
        let capacity = 4;
        let payload: Vec<u8> = (0..40u8).collect();
        let buffer = Arc::new(SharedBuffer::new(capacity));
        let producer_buffer = buffer.clone();
        let producer_payload = payload.clone();

        let producer = std::thread::spawn(move || {
            producer_buffer
                .push_payload(&producer_payload, Duration::from_secs(5), POLL)
                .unwrap()
        });

        let mut observed_chunks: Vec<Vec<u8>> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match buffer.signal() {
                SIGNAL_CHUNK_READY => {
                    let len = buffer.chunk_len.load(Ordering::Acquire);
                    let first = { buffer.data.lock()[..len].to_vec() };
                    // Consumer stalls with the chunk undrained; the producer
                    // must not touch the region until the ack.
                    std::thread::sleep(Duration::from_millis(5));
                    let second = { buffer.data.lock()[..len].to_vec() };
                    assert_eq!(first, second, "producer overwrote an undrained chunk");
                    observed_chunks.push(second);
                    buffer.signal.store(SIGNAL_IDLE, Ordering::Release);
                }
                SIGNAL_DONE => break,
                _ => std::thread::sleep(POLL),
            }
            assert!(Instant::now() < deadline, "transfer did not finish");
        }

        assert_eq!(producer.join().unwrap(), 10);
        assert_eq!(observed_chunks.len(), 10);
        let reassembled: Vec<u8> = observed_chunks.concat();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_consumer_timeout_is_bounded() {
        // No producer ever signals; the consumer must give up within
        // fetch_timeout + poll_interval, not hang.
        let buffer = SharedBuffer::new(16);
        let timeout = Duration::from_millis(100);
        let poll = Duration::from_millis(10);

        let start = Instant::now();
        let result = buffer.await_payload(timeout, poll);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(RunnerError::FetchTimeout { .. })));
        assert!(
            elapsed < timeout + poll * 10,
            "timeout took {:?}, expected close to {:?}",
            elapsed,
            timeout
        );
    }

    #[test]
    fn test_error_passthrough() {
        let buffer = Arc::new(SharedBuffer::new(64));
        let producer_buffer = buffer.clone();

        let producer = std::thread::spawn(move || {
            producer_buffer
                .push_error("server error", ACK_TIMEOUT, POLL)
                .unwrap();
        });

        let result = buffer.await_payload(ACK_TIMEOUT, POLL);
        producer.join().unwrap();

        match result {
            Err(RunnerError::FetchTransport(msg)) => assert_eq!(msg, "server error"),
            other => panic!("expected FetchTransport, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_error_message_truncated_with_marker() {
        let buffer = Arc::new(SharedBuffer::new(32));
        let long_message = "x".repeat(500);
        let producer_buffer = buffer.clone();

        let producer = std::thread::spawn(move || {
            producer_buffer
                .push_error(&long_message, ACK_TIMEOUT, POLL)
                .unwrap();
        });

        let result = buffer.await_payload(ACK_TIMEOUT, POLL);
        producer.join().unwrap();

        match result {
            Err(RunnerError::FetchTransport(msg)) => {
                assert!(msg.len() <= 32);
                assert!(msg.ends_with("...[truncated]"));
            }
            other => panic!("expected FetchTransport, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_consumer_rejects_unexpected_signal() {
        let buffer = SharedBuffer::new(16);
        buffer.poison_signal(42);
        let result = buffer.await_payload(Duration::from_millis(50), POLL);
        assert!(matches!(result, Err(RunnerError::Protocol(_))));
    }

    #[test]
    fn test_producer_bails_on_stalled_consumer() {
        // Nothing ever drains the first chunk; the second write must fail
        // with a protocol error instead of spinning forever.
        let buffer = SharedBuffer::new(4);
        let payload = patterned(8);
        let result = buffer.push_payload(&payload, Duration::from_millis(80), POLL);
        assert!(matches!(result, Err(RunnerError::Protocol(_))));
    }

    #[test]
    fn test_fresh_buffer_starts_idle() {
        let buffer = SharedBuffer::new(16);
        assert_eq!(buffer.signal(), SIGNAL_IDLE);
        assert_eq!(buffer.capacity(), 16);
    }
}
