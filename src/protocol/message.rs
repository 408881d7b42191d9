//! Control messages and the run/result data model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTP method for a guest-issued fetch. The guest surface only exposes the
/// two the reference behavior supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            _ => None,
        }
    }
}

/// One guest network call, created by the interpreter engine.
///
/// Exactly one is in flight at a time per run; the guest fetch call blocks
/// until the response (or an error) comes back through the shared buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        FetchRequest {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        FetchRequest {
            method: HttpMethod::Post,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body.into()),
        }
    }
}

/// Response from the host's privileged network primitive.
/// Any status outside [200, 300) is treated as a failed fetch.
/// The body stays raw bytes end to end; only the guest decides whether to
/// read it as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Kind of renderable artifact extracted from the guest's final scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FigureKind {
    Plot,
    Markup,
}

/// A renderable artifact: base64 payload for plots, rendered text for markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Figure {
    pub kind: FigureKind,
    pub data: String,
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Display form of the last evaluated value, if it was a primitive,
    /// string, or tabular object (rendered to markup).
    #[serde(rename = "rawOutput")]
    pub raw_output: String,
    /// Figures in binding order. Unbounded in principle, practically small.
    #[serde(default)]
    pub figures: Vec<Figure>,
}

/// Labels the origin of a failed run so timeouts and init failures stay
/// distinguishable from ordinary guest exceptions in logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Guest,
    FetchTimeout,
    Init,
}

impl ErrorKind {
    /// The same label serde uses on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Guest => "guest",
            ErrorKind::FetchTimeout => "fetch-timeout",
            ErrorKind::Init => "init",
        }
    }
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::Guest
    }
}

/// Terminal result of one run. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    Success {
        stdout: Vec<String>,
        stderr: Vec<String>,
        output: RunOutput,
    },
    Error {
        stdout: Vec<String>,
        stderr: Vec<String>,
        message: String,
        #[serde(default)]
        kind: ErrorKind,
    },
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success { .. })
    }

    pub fn stdout(&self) -> &[String] {
        match self {
            RunResult::Success { stdout, .. } => stdout,
            RunResult::Error { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &[String] {
        match self {
            RunResult::Success { stderr, .. } => stderr,
            RunResult::Error { stderr, .. } => stderr,
        }
    }
}

/// Control messages between the two execution contexts.
///
/// Chunked response payloads do NOT travel as messages - they move through
/// the shared buffer. The `id` on `fetch` is the correlation id used both for
/// logging and as the persistent cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "run")]
    Run { code: String },

    #[serde(rename = "fetch")]
    Fetch {
        id: String,
        #[serde(flatten)]
        request: FetchRequest,
    },

    #[serde(rename = "run-done")]
    RunDone { result: RunResult },
}

impl Message {
    pub fn run(code: impl Into<String>) -> Self {
        Message::Run { code: code.into() }
    }

    pub fn fetch(id: impl Into<String>, request: FetchRequest) -> Self {
        Message::Fetch {
            id: id.into(),
            request,
        }
    }

    pub fn run_done(result: RunResult) -> Self {
        Message::RunDone { result }
    }

    /// Correlation id, where the message carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Fetch { id, .. } => Some(id),
            _ => None,
        }
    }

    /// The wire value of the `type` tag, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Run { .. } => "run",
            Message::Fetch { .. } => "fetch",
            Message::RunDone { .. } => "run-done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_message_wire_format() {
        let msg = Message::run("x = 1 + 1\nx");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"run""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_fetch_message_flattens_request() {
        let mut request = FetchRequest::get("https://example.com/data");
        request
            .headers
            .insert("accept".to_string(), "text/plain".to_string());
        let msg = Message::fetch("req-1", request);

        let json = serde_json::to_string(&msg).unwrap();
        // Request fields sit at the top level, not nested under "request"
        assert!(json.contains(r#""type":"fetch""#));
        assert!(json.contains(r#""method":"GET""#));
        assert!(json.contains(r#""url":"https://example.com/data""#));
        assert!(!json.contains(r#""request""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id(), Some("req-1"));
    }

    #[test]
    fn test_run_done_round_trip() {
        let result = RunResult::Success {
            stdout: vec!["hello".to_string()],
            stderr: vec![],
            output: RunOutput {
                raw_output: "2".to_string(),
                figures: vec![Figure {
                    kind: FigureKind::Markup,
                    data: "<table/>".to_string(),
                }],
            },
        };
        let msg = Message::run_done(result);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"run-done""#));
        assert!(json.contains(r#""status":"success""#));
        assert!(json.contains(r#""rawOutput":"2""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_error_result_defaults_to_guest_kind() {
        let json = r#"{"status":"error","stdout":[],"stderr":[],"message":"boom"}"#;
        let result: RunResult = serde_json::from_str(json).unwrap();
        match result {
            RunResult::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Guest);
                assert_eq!(message, "boom");
            }
            _ => panic!("expected error variant"),
        }
    }

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::FetchTimeout).unwrap(),
            r#""fetch-timeout""#
        );
        assert_eq!(serde_json::to_string(&ErrorKind::Init).unwrap(), r#""init""#);
    }

    #[test]
    fn test_http_response_success_range() {
        let mut response = HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        assert!(response.is_success());
        response.status = 299;
        assert!(response.is_success());
        response.status = 300;
        assert!(!response.is_success());
        response.status = 500;
        assert!(!response.is_success());
    }

    #[test]
    fn test_http_response_body_is_raw_bytes() {
        // Bodies are not required to be UTF-8; the struct must carry
        // arbitrary octets unchanged.
        let response = HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: vec![0x89, b'P', b'N', b'G', 0xff, 0x00],
        };
        assert!(response.is_success());
        assert_eq!(response.body.as_slice(), &[0x89, b'P', b'N', b'G', 0xff, 0x00]);
        assert!(String::from_utf8(response.body).is_err());
    }
}
