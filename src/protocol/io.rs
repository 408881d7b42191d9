//! JSONL transport for control messages.
//!
//! One message per line on each side of the stream. A line that fails to
//! parse must never take the serve loop down: `parse_message_graceful`
//! classifies the failure and [`JsonlReader`] skips past it, so a client
//! speaking a newer protocol revision degrades to warnings instead of a
//! dead runner.

use std::io::{BufRead, BufReader, Read};
use tracing::{debug, warn};

use super::message::Message;

/// Cap on raw message text quoted in log records; fetch bodies and run
/// results can be large
const MAX_RAW_LOG_PREVIEW: usize = 200;

/// Truncated view of a raw line plus its full length, for log fields
pub fn log_preview(raw: &str) -> (&str, usize) {
    let len = raw.len();
    if len > MAX_RAW_LOG_PREVIEW {
        (&raw[..MAX_RAW_LOG_PREVIEW], len)
    } else {
        (raw, len)
    }
}

/// Strict parse of one message line; any failure is the caller's problem
pub fn parse_message(line: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str(line).map_err(|e| {
        warn!(
            raw_input = %line,
            error = %e,
            "Failed to parse control message"
        );
        e
    })
}

/// Outcome of classifying one line. Every variant short of `Ok` is
/// skippable; the distinctions exist so the log record says exactly what
/// was wrong with the line.
#[derive(Debug)]
pub enum ParseResult {
    Ok(Message),
    /// Valid JSON with no "type" field at all
    MissingType { raw: String },
    /// A "type" tag this protocol revision does not know
    UnknownType { message_type: String, raw: String },
    /// Recognized type, but the payload fields don't deserialize
    InvalidPayload {
        message_type: String,
        error: String,
        raw: String,
    },
    /// Not JSON
    ParseError(serde_json::Error),
}

/// Classify one line without failing on foreign message types.
///
/// Parses to `serde_json::Value` once and converts from there, so an
/// unknown "type" tag is detected without a second full parse. Serde's
/// "unknown variant" error text is the discriminator between an unknown
/// tag and a known tag with a broken payload.
pub fn parse_message_graceful(line: &str) -> ParseResult {
    let (preview, _raw_len) = log_preview(line);

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        // Logging happens in the reader, where line context is known
        Err(e) => return ParseResult::ParseError(e),
    };

    let msg_type: String = match value.get("type").and_then(|t| t.as_str()) {
        Some(t) => t.to_string(),
        None => {
            return ParseResult::MissingType {
                raw: preview.to_string(),
            };
        }
    };

    match serde_json::from_value::<Message>(value) {
        Ok(msg) => ParseResult::Ok(msg),
        Err(e) => {
            let error_str = e.to_string();
            if error_str.contains("unknown variant") {
                ParseResult::UnknownType {
                    message_type: msg_type,
                    raw: preview.to_string(),
                }
            } else {
                ParseResult::InvalidPayload {
                    message_type: msg_type,
                    error: error_str,
                    raw: preview.to_string(),
                }
            }
        }
    }
}

/// One message as one JSON line; the newline is the caller's to write
pub fn serialize_message(msg: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Pull-based reader over a stream of message lines.
///
/// The line buffer is owned by the reader and reused, so a long-lived
/// serve loop does not allocate per line.
pub struct JsonlReader<R: Read> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> JsonlReader<R> {
    pub fn new(reader: R) -> Self {
        JsonlReader {
            reader: BufReader::new(reader),
            line_buffer: String::with_capacity(1024),
        }
    }

    /// Strict read: the next message, `None` at end of stream, or the
    /// first parse/IO error encountered. Blank lines are skipped.
    pub fn next_message(&mut self) -> Result<Option<Message>, Box<dyn std::error::Error>> {
        // Loop instead of recursion so runs of empty lines can't overflow the stack
        loop {
            self.line_buffer.clear();
            match self.reader.read_line(&mut self.line_buffer)? {
                0 => {
                    debug!("Control stream ended");
                    return Ok(None);
                }
                bytes_read => {
                    debug!(bytes_read, "Read control line");
                    let trimmed = self.line_buffer.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let msg = parse_message(trimmed)?;
                    return Ok(Some(msg));
                }
            }
        }
    }

    /// Tolerant read for the serve loop: unparsable and foreign lines are
    /// logged at warn and skipped, and only an IO failure surfaces as an
    /// error. `None` still means end of stream.
    pub fn next_message_graceful(&mut self) -> Result<Option<Message>, std::io::Error> {
        loop {
            self.line_buffer.clear();
            match self.reader.read_line(&mut self.line_buffer)? {
                0 => {
                    debug!("Control stream ended");
                    return Ok(None);
                }
                _ => {
                    let trimmed = self.line_buffer.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let (preview, raw_len) = log_preview(trimmed);

                    match parse_message_graceful(trimmed) {
                        ParseResult::Ok(msg) => {
                            debug!(message_type = msg.type_name(), "Parsed control message");
                            return Ok(Some(msg));
                        }
                        ParseResult::MissingType { .. } => {
                            warn!(
                                raw_preview = %preview,
                                raw_len = raw_len,
                                "Skipping control line without a 'type' field"
                            );
                            continue;
                        }
                        ParseResult::UnknownType { message_type, .. } => {
                            warn!(
                                message_type = %message_type,
                                raw_preview = %preview,
                                raw_len = raw_len,
                                "Skipping line with unrecognized message type"
                            );
                            continue;
                        }
                        ParseResult::InvalidPayload {
                            message_type,
                            error,
                            ..
                        } => {
                            warn!(
                                message_type = %message_type,
                                error = %error,
                                raw_preview = %preview,
                                raw_len = raw_len,
                                "Skipping message whose payload failed to deserialize"
                            );
                            continue;
                        }
                        ParseResult::ParseError(e) => {
                            warn!(
                                error = %e,
                                raw_preview = %preview,
                                raw_len = raw_len,
                                "Skipping non-JSON control line"
                            );
                            continue;
                        }
                    }
                }
            }
        }
    }
}
