//! Host-side run orchestration.
//!
//! The orchestrator owns every privileged capability: it performs the real
//! HTTP requests, mirrors responses into the fetch cache, and enforces the
//! run deadline. The worker is a fresh OS thread per run that evaluates guest
//! code and can only ask for the network by sending a fetch message paired
//! with a shared buffer; the host answers through that buffer.
//!
//! Lifecycle per run:
//!   spawn worker -> serve fetch messages -> run-done | deadline -> cleanup
//!
//! A worker that blows the deadline is abandoned, not killed. Its only
//! blocking operation is the bounded fetch wait, so it always exits on its
//! own shortly after; cleanup of the registry entry happens exactly once on
//! the host regardless.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::SharedBuffer;
use crate::cache::FetchCache;
use crate::config::RunnerConfig;
use crate::engine::{BundledInstaller, ExecutionSession};
use crate::error::{Result, ResultExt, RunnerError};
use crate::interpreter::FetchPrimitive;
use crate::logging::{log_bridge_event, log_run_event};
use crate::protocol::{
    log_preview, serialize_message, FetchRequest, HttpMethod, HttpResponse, Message, RunResult,
};
use crate::workers::WorkerRegistry;

/// Performs the actual HTTP request for a relayed fetch.
///
/// Split behind a trait so orchestration tests run without a network; the
/// production implementation is [`UreqClient`].
pub trait HttpClient: Send + Sync {
    fn execute(&self, request: &FetchRequest) -> Result<HttpResponse>;
}

/// Blocking HTTP client used in production.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new(timeout: std::time::Duration) -> Self {
        // Non-2xx statuses come back as responses, not errors: the guest is
        // the one who decides what a 500 means.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .new_agent();
        UreqClient { agent }
    }
}

impl HttpClient for UreqClient {
    fn execute(&self, request: &FetchRequest) -> Result<HttpResponse> {
        let result = match request.method {
            HttpMethod::Get => {
                let mut builder = self.agent.get(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name, value);
                }
                builder.call()
            }
            HttpMethod::Post => {
                let mut builder = self.agent.post(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name, value);
                }
                builder.send(request.body.as_deref().unwrap_or(""))
            }
        };

        let mut response = result.map_err(|e| RunnerError::FetchTransport(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        let body = response
            .body_mut()
            .read_to_vec()
            .map_err(|e| RunnerError::FetchTransport(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Event sent from the worker thread to the host loop. A fetch carries the
/// shared buffer the host must answer through; run-done carries nothing.
struct WorkerEvent {
    message: Message,
    buffer: Option<Arc<SharedBuffer>>,
}

/// Worker-side fetch capability: posts the request to the host along with a
/// fresh shared buffer, then blocks on the buffer until the host delivers.
struct BridgeFetch {
    run_id: String,
    events: mpsc::Sender<WorkerEvent>,
    config: RunnerConfig,
}

impl FetchPrimitive for BridgeFetch {
    fn fetch(&mut self, request: FetchRequest) -> Result<Vec<u8>> {
        let fetch_id = Uuid::new_v4().to_string();
        let buffer = Arc::new(SharedBuffer::new(self.config.chunk_capacity));
        debug!(run_id = %self.run_id, %fetch_id, url = %request.url, "Guest fetch, relaying to host");

        self.events
            .send(WorkerEvent {
                message: Message::fetch(fetch_id, request),
                buffer: Some(buffer.clone()),
            })
            .map_err(|_| RunnerError::WorkerCrashed("host channel closed".to_string()))?;

        buffer.await_payload(self.config.fetch_timeout(), self.config.poll_interval())
    }
}

/// Privileged host for sandboxed runs.
pub struct Orchestrator {
    config: RunnerConfig,
    http: Arc<dyn HttpClient>,
    cache: Option<Arc<FetchCache>>,
    registry: Arc<WorkerRegistry>,
}

impl Orchestrator {
    /// Production setup: real HTTP client, cache at the configured path.
    /// A cache that fails to open is logged and skipped; runs proceed
    /// without mirroring.
    pub fn new(config: RunnerConfig) -> Self {
        let http = Arc::new(UreqClient::new(config.fetch_timeout()));
        let cache = FetchCache::open(&config.resolved_cache_path())
            .warn_on_err()
            .map(Arc::new);
        Orchestrator {
            config,
            http,
            cache,
            registry: Arc::new(WorkerRegistry::new()),
        }
    }

    /// Build with an injected HTTP client and no cache.
    pub fn with_http_client(config: RunnerConfig, http: Arc<dyn HttpClient>) -> Self {
        Orchestrator {
            config,
            http,
            cache: None,
            registry: Arc::new(WorkerRegistry::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<FetchCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Execute one piece of guest code in a fresh worker.
    ///
    /// Guest failures come back as `Ok(RunResult::Error { .. })`; an `Err`
    /// means the run itself broke down (spawn failure, deadline, crash).
    pub fn run(&self, code: &str) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        log_run_event(&run_id, "started", None, true);

        self.registry.register(&run_id);
        let _cleanup = CleanupGuard {
            registry: &self.registry,
            run_id: &run_id,
        };

        let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
        self.spawn_worker(&run_id, code, events_tx)?;

        let deadline = started + self.config.run_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Abandon the worker: its only blocking wait is the bounded
                // fetch poll, so it exits on its own.
                log_run_event(
                    &run_id,
                    "timeout",
                    Some(started.elapsed().as_millis() as u64),
                    false,
                );
                return Err(RunnerError::RunTimeout {
                    timeout_ms: self.config.run_timeout_ms,
                });
            }

            match events_rx.recv_timeout(remaining) {
                Ok(event) => match event.message {
                    Message::Fetch { id, request } => {
                        self.serve_fetch(&run_id, &id, &request, event.buffer);
                    }
                    Message::RunDone { result } => {
                        log_run_event(
                            &run_id,
                            "completed",
                            Some(started.elapsed().as_millis() as u64),
                            result.is_success(),
                        );
                        return Ok(result);
                    }
                    Message::Run { .. } => {
                        crate::debug_panic!("worker sent a run message to the host");
                    }
                },
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // Loop back around; the deadline check handles it.
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log_run_event(
                        &run_id,
                        "crashed",
                        Some(started.elapsed().as_millis() as u64),
                        false,
                    );
                    return Err(RunnerError::WorkerCrashed(
                        "event channel closed before run-done".to_string(),
                    ));
                }
            }
        }
    }

    fn spawn_worker(
        &self,
        run_id: &str,
        code: &str,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<()> {
        let fetch = BridgeFetch {
            run_id: run_id.to_string(),
            events: events.clone(),
            config: self.config.clone(),
        };
        let code = code.to_string();
        let name = format!("codecell-worker-{}", &run_id[..8]);

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let session = ExecutionSession::new(Box::new(BundledInstaller));
                let result = session.execute(&code, Box::new(fetch));
                // The host may already have abandoned us; nothing to do then.
                let _ = events.send(WorkerEvent {
                    message: Message::run_done(result),
                    buffer: None,
                });
            })
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;

        info!(%run_id, "Worker spawned");
        Ok(())
    }

    /// Answer one relayed fetch through its shared buffer. Failures here are
    /// delivered to the guest as bridge errors, never surfaced to the caller.
    fn serve_fetch(
        &self,
        run_id: &str,
        fetch_id: &str,
        request: &FetchRequest,
        buffer: Option<Arc<SharedBuffer>>,
    ) {
        let Some(buffer) = buffer else {
            crate::debug_panic!("fetch message arrived without a shared buffer");
            return;
        };

        if let Some(line) = serialize_message(&Message::fetch(fetch_id, request.clone())).log_err()
        {
            let (preview, total) = log_preview(&line);
            debug!(%run_id, %preview, total_len = total, "Serving relayed fetch");
        }

        let ack_timeout = self.config.fetch_timeout();
        let poll = self.config.poll_interval();

        match self.http.execute(request) {
            Ok(response) if response.is_success() => {
                if let Some(cache) = &self.cache {
                    cache
                        .put(fetch_id, &request.url, &response.body)
                        .warn_on_err();
                }
                match buffer.push_payload(&response.body, ack_timeout, poll) {
                    Ok(chunks) => {
                        log_bridge_event(run_id, "fetch-delivered", response.body.len(), chunks)
                    }
                    Err(err) => warn!(%run_id, %fetch_id, %err, "Failed to deliver fetch response"),
                }
            }
            Ok(response) => {
                let body = String::from_utf8_lossy(&response.body);
                let message = format!("HTTP {}: {}", response.status, body.trim());
                buffer.push_error(&message, ack_timeout, poll).warn_on_err();
            }
            Err(err) => {
                buffer
                    .push_error(&err.to_string(), ack_timeout, poll)
                    .warn_on_err();
            }
        }
    }
}

/// Unregisters the worker exactly once, on every exit path.
struct CleanupGuard<'a> {
    registry: &'a WorkerRegistry,
    run_id: &'a str,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if self.registry.unregister(self.run_id) {
            debug!(run_id = %self.run_id, "Run cleanup complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorKind;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            run_timeout_ms: 5_000,
            fetch_timeout_ms: 1_000,
            poll_interval_ms: 5,
            chunk_capacity: 64 * 1024,
            cache_path: None,
        }
    }

    /// Responds to every request with a fixed status and body, optionally
    /// after a delay.
    struct CannedClient {
        status: u16,
        body: &'static [u8],
        delay: Duration,
    }

    impl CannedClient {
        fn ok(body: &'static [u8]) -> Self {
            CannedClient {
                status: 200,
                body,
                delay: Duration::ZERO,
            }
        }
    }

    impl HttpClient for CannedClient {
        fn execute(&self, _request: &FetchRequest) -> Result<HttpResponse> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            Ok(HttpResponse {
                status: self.status,
                headers: BTreeMap::new(),
                body: self.body.to_vec(),
            })
        }
    }

    #[test]
    fn test_run_without_fetch() {
        let orch = Orchestrator::with_http_client(test_config(), Arc::new(CannedClient::ok(b"")));
        let result = orch.run("x = 1 + 1\nx").unwrap();
        match result {
            RunResult::Success { output, .. } => assert_eq!(output.raw_output, "2"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_round_trip() {
        let orch =
            Orchestrator::with_http_client(test_config(), Arc::new(CannedClient::ok(b"hello")));
        let result = orch
            .run("body = fetch(\"https://example.com/greeting\")\nbody")
            .unwrap();
        match result {
            RunResult::Success { output, .. } => assert_eq!(output.raw_output, "hello"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_chunked_through_small_buffer() {
        let mut config = test_config();
        config.chunk_capacity = 8;
        let body: &'static [u8] = b"a response well past eight bytes";
        let orch = Orchestrator::with_http_client(config, Arc::new(CannedClient::ok(body)));
        let result = orch
            .run("body = fetch(\"https://example.com/long\")\nbody")
            .unwrap();
        match result {
            RunResult::Success { output, .. } => {
                assert_eq!(output.raw_output.as_bytes(), body);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_passes_through_to_guest() {
        let orch = Orchestrator::with_http_client(
            test_config(),
            Arc::new(CannedClient {
                status: 500,
                body: b"server error",
                delay: Duration::ZERO,
            }),
        );
        let result = orch.run("fetch(\"https://example.com/broken\")").unwrap();
        match result {
            RunResult::Error { message, kind, .. } => {
                assert!(message.contains("server error"), "message: {}", message);
                assert_eq!(kind, ErrorKind::Guest);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_guest_error_reported() {
        let orch = Orchestrator::with_http_client(test_config(), Arc::new(CannedClient::ok(b"")));
        let result = orch.run("raise_error()").unwrap();
        match result {
            RunResult::Error { message, kind, .. } => {
                assert!(message.contains("undefined function 'raise_error'"));
                assert_eq!(kind, ErrorKind::Guest);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_timeout_reported_as_timeout_kind() {
        let mut config = test_config();
        config.fetch_timeout_ms = 50;
        let orch = Orchestrator::with_http_client(
            config,
            Arc::new(CannedClient {
                status: 200,
                body: b"too late",
                delay: Duration::from_millis(300),
            }),
        );
        let result = orch.run("fetch(\"https://example.com/slow\")").unwrap();
        match result {
            RunResult::Error { kind, .. } => assert_eq!(kind, ErrorKind::FetchTimeout),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_run_deadline_abandons_worker() {
        let mut config = test_config();
        config.run_timeout_ms = 100;
        config.fetch_timeout_ms = 1_000;
        // Serving the fetch alone takes longer than the whole run budget, so
        // the deadline check fires before run-done is picked up.
        let orch = Orchestrator::with_http_client(
            config,
            Arc::new(CannedClient {
                status: 200,
                body: b"slow",
                delay: Duration::from_millis(250),
            }),
        );
        let err = orch
            .run("fetch(\"https://example.com/slow\")")
            .unwrap_err();
        assert!(matches!(err, RunnerError::RunTimeout { timeout_ms: 100 }));
        assert_eq!(orch.registry().active_count(), 0);
    }

    #[test]
    fn test_cleanup_is_exactly_once_and_runs_are_independent() {
        let orch = Orchestrator::with_http_client(test_config(), Arc::new(CannedClient::ok(b"")));

        let first = orch.run("x = 41\nx + 1").unwrap();
        assert!(first.is_success());
        assert_eq!(orch.registry().active_count(), 0);

        // No state from the first run leaks into the second
        let second = orch.run("x").unwrap();
        match second {
            RunResult::Error { message, .. } => {
                assert!(message.contains("undefined variable 'x'"))
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(orch.registry().active_count(), 0);
    }

    #[test]
    fn test_successful_fetch_mirrors_into_cache() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(FetchCache::open(&dir.path().join("cache.sqlite")).unwrap());
        let orch =
            Orchestrator::with_http_client(test_config(), Arc::new(CannedClient::ok(b"cached!")))
                .with_cache(cache.clone());

        orch.run("fetch(\"https://example.com/data\")").unwrap();
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_failed_fetch_not_cached() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(FetchCache::open(&dir.path().join("cache.sqlite")).unwrap());
        let orch = Orchestrator::with_http_client(
            test_config(),
            Arc::new(CannedClient {
                status: 404,
                body: b"not found",
                delay: Duration::ZERO,
            }),
        )
        .with_cache(cache.clone());

        orch.run("fetch(\"https://example.com/missing\")").unwrap();
        assert!(cache.is_empty().unwrap());
    }
}
