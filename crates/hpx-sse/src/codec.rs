//! Wire framing for `text/event-stream`.
//!
//! Outbound frames always carry an `id:` line, an optional `event:` line and
//! a single `data:` line holding the JSON-serialized payload, terminated by a
//! blank line:
//!
//! ```text
//! id: 7
//! event: counter
//! data: {"count":3}
//!
//! ```
//!
//! [`FrameDecoder`] is the inverse used by the HTTP client transport. It
//! follows the
//! [event stream interpretation rules](https://html.spec.whatwg.org/multipage/server-sent-events.html#event-stream-interpretation)
//! so it also accepts streams produced by other servers.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::Serialize;

use crate::error::{SseError, SseResult};

/// Event type assumed when a frame has no `event:` line.
pub const DEFAULT_EVENT: &str = "message";

/// Comment text used for keep-alive frames.
pub const KEEP_ALIVE_COMMENT: &str = "keepalive";

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const BOM: &[u8] = "\u{FEFF}".as_bytes();

/// Encode one message frame.
///
/// An empty `event` is treated like `None`, so the frame is delivered under
/// [`DEFAULT_EVENT`].
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized or the event name
/// contains a line break.
pub fn encode_frame<T>(id: u64, payload: &T, event: Option<&str>) -> SseResult<String>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_string(payload)?;

    let mut frame = String::with_capacity(data.len() + 32);
    frame.push_str("id: ");
    frame.push_str(&id.to_string());
    frame.push('\n');

    if let Some(name) = event.filter(|name| !name.is_empty()) {
        if name.contains(['\n', '\r']) {
            return Err(SseError::invalid_event_name(name));
        }
        frame.push_str("event: ");
        frame.push_str(name);
        frame.push('\n');
    }

    frame.push_str("data: ");
    frame.push_str(&data);
    frame.push_str("\n\n");
    Ok(frame)
}

/// Encode a `retry:` directive advising the client's reconnect delay.
pub fn encode_retry(delay: Duration) -> String {
    format!("retry: {}\n\n", delay.as_millis())
}

/// Encode a comment frame. Clients ignore these; they keep idle proxies from
/// timing the connection out.
pub fn encode_comment(text: &str) -> String {
    format!(": {}\n\n", text.replace(['\n', '\r'], " "))
}

/// A dispatched event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEvent {
    /// Event type, [`DEFAULT_EVENT`] when the frame had none.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream so far (may be empty).
    pub id: String,
}

/// Output of [`FrameDecoder::decode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete event.
    Event(DecodedEvent),
    /// A reconnection time advised by the server.
    Retry(Duration),
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    bom_checked: bool,
    event: Option<String>,
    data: String,
    last_event_id: String,
}

impl FrameDecoder {
    /// Create a decoder for a fresh stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last event id seen on this stream.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    ///
    /// Partial lines are buffered until the next call.
    ///
    /// # Errors
    ///
    /// Returns [`SseError::Parse`] when a line is not valid UTF-8.
    pub fn decode(&mut self, chunk: &[u8]) -> SseResult<Vec<Decoded>> {
        self.buffer.extend_from_slice(chunk);

        if !self.bom_checked {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return Ok(Vec::new());
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        let mut out = Vec::new();
        while let Some((line_end, next)) = find_eol(&self.buffer) {
            let line = self.buffer.split_to(next);
            self.process_line(&line[..line_end], &mut out)?;
        }
        Ok(out)
    }

    fn process_line(&mut self, line: &[u8], out: &mut Vec<Decoded>) -> SseResult<()> {
        if line.is_empty() {
            self.dispatch(out);
            return Ok(());
        }
        if line[0] == b':' {
            return Ok(());
        }

        let (name, value) = match memchr::memchr(b':', line) {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &[][..]),
        };
        let value = std::str::from_utf8(value)
            .map_err(|e| SseError::parse(format!("invalid UTF-8 in field value: {e}")))?;

        match name {
            b"event" => self.event = Some(value.to_string()),
            b"data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            b"id" if !value.contains('\0') => self.last_event_id = value.to_string(),
            b"retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                if let Ok(ms) = value.parse::<u64>() {
                    out.push(Decoded::Retry(Duration::from_millis(ms)));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn dispatch(&mut self, out: &mut Vec<Decoded>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }

        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        out.push(Decoded::Event(DecodedEvent {
            event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
            id: self.last_event_id.clone(),
        }));
    }
}

/// Returns `(line_end, remainder_start)`, or `None` when more bytes are
/// needed. A trailing CR may be the first half of a CRLF pair.
fn find_eol(bytes: &[u8]) -> Option<(usize, usize)> {
    let pos = memchr::memchr2(CR, LF, bytes)?;
    if bytes[pos] == LF {
        return Some((pos, pos + 1));
    }
    match bytes.get(pos + 1) {
        None => None,
        Some(&LF) => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
    }
}
