//! Incremental decoder for line-oriented streaming replies (server-sent
//! events carrying token deltas).
//!
//! Input arrives in arbitrary chunks; only complete `\n`-terminated lines are
//! decoded, so the emitted events do not depend on where the chunks split.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StreamError;

const DATA_PREFIX: &str = "data:";
const EVENT_PREFIX: &str = "event:";
const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into lines. Splitting happens on raw bytes, so a
/// multi-byte character cut between chunks is reassembled intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete lines contained in `chunk` plus any retained tail, without
    /// their terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            lines.push(to_line(&self.buf[start..end]));
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    /// The unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        Some(to_line(&rest))
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Metadata(Value),
    Done,
    Error(StreamError),
}

/// A single line that could not be decoded. Logged and skipped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json in line {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected payload in line {0:?}")]
    Payload(String),
}

#[derive(Debug, Default)]
pub struct StreamingDecoder {
    lines: LineBuffer,
    event_name: Option<String>,
    finished: bool,
    skipped: usize,
}

impl StreamingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `Done` or an error has been emitted; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let lines = self.lines.push(chunk);
        self.decode_lines(lines)
    }

    /// Decode whatever is left after the stream ended.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        match self.lines.finish() {
            Some(line) => self.decode_lines(vec![line]),
            None => Vec::new(),
        }
    }

    fn decode_lines(&mut self, lines: Vec<String>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in lines {
            match self.decode_line(&line) {
                Ok(decoded) => {
                    for event in decoded {
                        let terminal = matches!(event, StreamEvent::Done | StreamEvent::Error(_));
                        events.push(event);
                        if terminal {
                            self.finished = true;
                            return events;
                        }
                    }
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!("skipping stream line: {}", e);
                }
            }
        }
        events
    }

    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, DecodeError> {
        if line.trim().is_empty() {
            self.event_name = None;
            return Ok(Vec::new());
        }
        if line.starts_with(':') {
            return Ok(Vec::new());
        }
        if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
            self.event_name = Some(name.trim().to_string());
            return Ok(Vec::new());
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            debug!(line, "ignoring non-data line");
            return Ok(Vec::new());
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        if self.event_name.take().as_deref() == Some("error") {
            return Ok(vec![StreamEvent::Error(StreamError::Server(error_text(payload)))]);
        }
        if payload.trim() == DONE_SENTINEL {
            return Ok(vec![StreamEvent::Done]);
        }

        let value: Value = serde_json::from_str(payload)
            .map_err(|source| DecodeError::Json { line: line.to_string(), source })?;
        let Value::Object(map) = value else {
            return Err(DecodeError::Payload(line.to_string()));
        };

        if let Some(err) = map.get("error") {
            let text = match err {
                Value::String(s) => s.clone(),
                Value::Object(o) => o
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
                other => other.to_string(),
            };
            return Ok(vec![StreamEvent::Error(StreamError::Server(text))]);
        }

        let mut events = Vec::new();
        if let Some(token) = map.get("token") {
            match token {
                Value::String(s) => events.push(StreamEvent::Token(s.clone())),
                _ => return Err(DecodeError::Payload(line.to_string())),
            }
        }
        if let Some(meta) = map.get("enhanced_data") {
            events.push(StreamEvent::Metadata(meta.clone()));
        }
        if map.get("done").and_then(Value::as_bool) == Some(true) {
            events.push(StreamEvent::Done);
        }
        if events.is_empty() {
            debug!(line, "data line without a recognised field");
        }
        Ok(events)
    }
}

fn error_text(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map
            .get("error")
            .or_else(|| map.get("message"))
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_else(|| payload.to_string()),
        _ => payload.to_string(),
    }
}

/// A decoder running on its own task.
pub struct StreamingSession {
    events: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<()>,
}

impl StreamingSession {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop decoding and release the underlying stream. No `Done` is emitted.
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drive `stream` through a [`StreamingDecoder`]. A gap longer than `silence`
/// between chunks ends the session with a timeout error; a stream that ends
/// without a terminator is treated as done.
pub fn spawn_decoder<S, B, E>(stream: S, silence: Duration) -> StreamingSession
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        let mut decoder = StreamingDecoder::new();
        loop {
            let events = match tokio::time::timeout(silence, stream.next()).await {
                Err(_) => {
                    warn!(?silence, "streaming reply went silent");
                    vec![StreamEvent::Error(StreamError::Timeout(silence))]
                }
                Ok(None) => {
                    let mut events = decoder.finish();
                    if !decoder.is_finished() {
                        events.push(StreamEvent::Done);
                    }
                    events
                }
                Ok(Some(Err(e))) => vec![StreamEvent::Error(StreamError::Http(e.to_string()))],
                Ok(Some(Ok(chunk))) => decoder.feed(chunk.as_ref()),
            };
            let terminal = events.iter().any(|e| matches!(e, StreamEvent::Done | StreamEvent::Error(_)));
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if terminal {
                return;
            }
        }
    });
    StreamingSession { events: rx, task }
}

/// POST `body` to `url` and decode the streamed response.
pub async fn open_reply_stream(
    http: &reqwest::Client,
    url: &str,
    body: &Value,
    silence: Duration,
) -> Result<StreamingSession, StreamError> {
    let response = http
        .post(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(body)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(StreamError::Server(format!("{}: {}", status, text)));
    }
    Ok(spawn_decoder(response.bytes_stream(), silence))
}
