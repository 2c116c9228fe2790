//! Incremental decoding of streamed JSON.
//!
//! The decoder turns a raw byte feed into a lazy, ordered sequence of
//! [`StreamEvent`]s. Two framings are supported:
//!
//! - [`Framing::Json`]: concatenated or newline-delimited JSON. Object and
//!   array boundaries are found by a depth-counting scanner that tracks string
//!   literals and escapes, so braces inside string values never split a value.
//! - [`Framing::EventStream`]: SSE frames whose `data:` payloads are JSON,
//!   terminated by `data: [DONE]`.
//!
//! Malformed values become [`StreamEvent::DecodeFailure`] markers instead of
//! errors, so the rest of a partially broken stream stays consumable. A
//! payload shaped like a rate-limit error (`{"error": {"status": 429}}` or
//! `{"error": {"type": "rate_limit_error"}}`) ends the stream with a single
//! [`StreamEvent::RateLimited`] sentinel.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use steady_core::RequestError;

use crate::sse::SseParser;

/// How the transport delimits values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Concatenated or newline-delimited JSON values
    Json,
    /// `text/event-stream` with JSON `data:` payloads
    EventStream,
}

impl Framing {
    /// Pick a framing from a `Content-Type` header value.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.to_ascii_lowercase().starts_with("text/event-stream") => Framing::EventStream,
            _ => Framing::Json,
        }
    }
}

/// One decoded item from a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A complete JSON value
    Data(Value),
    /// Text that could not be decoded as JSON
    DecodeFailure { raw: String, message: String },
    /// The remote service signalled rate limiting mid-stream
    RateLimited { retry_after: Option<Duration> },
    /// The transport failed after the stream was established
    Error(RequestError),
    /// The caller's cancellation token fired; always the last event
    Cancelled,
}

impl StreamEvent {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            StreamEvent::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, StreamEvent::Data(_))
    }
}

/// Lazily decoded event sequence.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Stateful decoder; feed it chunks in arrival order.
#[derive(Debug)]
pub struct StreamDecoder {
    framing: Framing,
    pending: Vec<u8>,
    scanner: JsonScanner,
    sse: SseParser,
    done: bool,
}

impl StreamDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: Vec::new(),
            scanner: JsonScanner::default(),
            sse: SseParser::new(),
            done: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// True once a terminator or rate-limit sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode a raw chunk. Multi-byte characters split across chunks are
    /// held back until their remaining bytes arrive.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.pending.extend_from_slice(bytes);

        let text = match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let tail = self.pending.split_off(valid);
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = tail;
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        };

        self.feed_str(&text)
    }

    /// Decode a chunk that is already text.
    pub fn feed_str(&mut self, text: &str) -> Vec<StreamEvent> {
        if self.done || text.is_empty() {
            return Vec::new();
        }

        let events = match self.framing {
            Framing::Json => {
                self.scanner.push(text);
                self.scanner.drain_values()
            }
            Framing::EventStream => {
                let frames = self.sse.feed(text);
                let mut events = Vec::new();
                for frame in frames {
                    if frame.is_done() {
                        debug!("Stream terminator received");
                        self.done = true;
                        break;
                    }
                    events.push(decode_frame(&frame.data, frame.is_error()));
                }
                events
            }
        };

        self.screen(events)
    }

    /// Flush remaining input at end of stream.
    ///
    /// Leftover non-whitespace text gets one final parse attempt; it yields
    /// either a value or a decode-failure marker.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            events.extend(self.feed_str(&tail));
            if self.done {
                return events;
            }
        }

        let trailing = match self.framing {
            Framing::Json => self.scanner.take_remainder().map(|raw| parse_value(&raw)),
            Framing::EventStream => self.sse.finish().and_then(|frame| {
                if frame.is_done() {
                    None
                } else {
                    Some(decode_frame(&frame.data, frame.is_error()))
                }
            }),
        };
        events.extend(trailing);
        self.done = true;
        self.screen(events)
    }

    /// Convert rate-limit payloads into the sentinel and drop everything
    /// after it.
    fn screen(&mut self, events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            if let StreamEvent::Data(value) = &event {
                if let Some(retry_after) = rate_limit_signal(value) {
                    debug!(?retry_after, "Rate limit signalled inside stream");
                    out.push(StreamEvent::RateLimited { retry_after });
                    self.done = true;
                    break;
                }
            }
            out.push(event);
        }
        out
    }
}

fn parse_value(raw: &str) -> StreamEvent {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => StreamEvent::Data(value),
        Err(e) => StreamEvent::DecodeFailure {
            raw: raw.to_string(),
            message: e.to_string(),
        },
    }
}

fn decode_frame(data: &str, is_error: bool) -> StreamEvent {
    let event = parse_value(data.trim());
    if !is_error {
        return event;
    }
    match event {
        StreamEvent::Data(value) if rate_limit_signal(&value).is_some() => StreamEvent::Data(value),
        _ => StreamEvent::Error(RequestError::Stream {
            message: data.to_string(),
        }),
    }
}

/// Recognise an in-band rate-limit error. Returns the retry hint, if any.
fn rate_limit_signal(value: &Value) -> Option<Option<Duration>> {
    let error = value.get("error")?;
    let status = error
        .get("status")
        .or_else(|| error.get("code"))
        .or_else(|| value.get("status"))
        .and_then(Value::as_u64);
    let kind = error.get("type").and_then(Value::as_str);

    if status != Some(429) && !matches!(kind, Some("rate_limit_error" | "rate_limited")) {
        return None;
    }

    let retry_after = error
        .get("retry_after")
        .or_else(|| value.get("retry_after"))
        .and_then(Value::as_f64)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    Some(retry_after)
}

/// Depth- and string-aware scanner over an append-only text buffer.
#[derive(Debug, Default)]
struct JsonScanner {
    buffer: String,
    /// Next byte to examine
    pos: usize,
    /// A value starts at offset 0 and is being scanned
    in_value: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonScanner {
    fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Extract every complete top-level object or array in the buffer.
    fn drain_values(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        while self.pos < self.buffer.len() {
            let byte = self.buffer.as_bytes()[self.pos];

            if !self.in_value {
                if byte == b'{' || byte == b'[' {
                    let junk: String = self.buffer.drain(..self.pos).collect();
                    let junk = junk.trim();
                    if !junk.is_empty() {
                        trace!(junk, "Text between JSON values");
                        events.push(StreamEvent::DecodeFailure {
                            raw: junk.to_string(),
                            message: "unexpected text between JSON values".to_string(),
                        });
                    }
                    self.in_value = true;
                    self.pos = 0;
                    self.depth = 1;
                }
                self.pos += 1;
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
            } else {
                match byte {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let raw: String = self.buffer.drain(..=self.pos).collect();
                            self.in_value = false;
                            self.pos = 0;
                            events.push(parse_value(&raw));
                            continue;
                        }
                    }
                    _ => {}
                }
            }
            self.pos += 1;
        }

        events
    }

    /// Take whatever is left if it is more than whitespace.
    fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.in_value = false;
        self.pos = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;

        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// Decode a stream of raw chunks into events.
///
/// The sequence ends after the transport ends, after a terminator or
/// rate-limit sentinel, after the first transport error (yielded as
/// [`StreamEvent::Error`]), or as soon as `cancel` fires (yielded as
/// [`StreamEvent::Cancelled`]). Ending drops the chunk stream, which releases
/// the underlying connection.
pub fn decode_stream<S, B>(chunks: S, framing: Framing, cancel: Option<CancellationToken>) -> EventStream
where
    S: Stream<Item = Result<B, RequestError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<S> {
        chunks: Option<Pin<Box<S>>>,
        decoder: StreamDecoder,
        queue: VecDeque<StreamEvent>,
        cancel: Option<CancellationToken>,
    }

    let state = State {
        chunks: Some(Box::pin(chunks)),
        decoder: StreamDecoder::new(framing),
        queue: VecDeque::new(),
        cancel,
    };

    let events = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }

            let chunks = state.chunks.as_mut()?;

            let next = match &state.cancel {
                Some(token) if token.is_cancelled() => None,
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        next = chunks.next() => Some(next),
                    }
                }
                None => Some(chunks.next().await),
            };

            match next {
                None => {
                    debug!("Stream cancelled by caller");
                    state.queue.push_back(StreamEvent::Cancelled);
                    state.chunks = None;
                }
                Some(Some(Ok(bytes))) => {
                    state.queue.extend(state.decoder.feed(bytes.as_ref()));
                    if state.decoder.is_done() {
                        state.chunks = None;
                    }
                }
                Some(Some(Err(e))) => {
                    debug!(error = %e, "Transport error mid-stream");
                    state.queue.push_back(StreamEvent::Error(e));
                    state.chunks = None;
                }
                Some(None) => {
                    state.queue.extend(state.decoder.finish());
                    state.chunks = None;
                }
            }
        }
    });

    Box::pin(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(events: &[StreamEvent]) -> Vec<Value> {
        events.iter().filter_map(|e| e.as_data().cloned()).collect()
    }

    fn decode_all(framing: Framing, chunks: &[&str]) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new(framing);
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk.as_bytes()));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn test_concatenated_objects_any_chunking() {
        let input = r#"{"a":1}{"b":[1,2,{"c":3}]} {"d":"x"}"#;
        let expected = vec![json!({"a": 1}), json!({"b": [1, 2, {"c": 3}]}), json!({"d": "x"})];

        for size in 1..=input.len() {
            let chunks: Vec<String> = input
                .as_bytes()
                .chunks(size)
                .map(|c| String::from_utf8(c.to_vec()).unwrap())
                .collect();
            let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
            let events = decode_all(Framing::Json, &refs);
            assert_eq!(values(&events), expected, "chunk size {}", size);
            assert_eq!(events.len(), 3);
        }
    }

    #[test]
    fn test_braces_inside_strings() {
        let events = decode_all(
            Framing::Json,
            &[r#"{"text": "a } b { c", "q": "say \"}\""}"#, "\n", r#"{"n": 2}"#],
        );
        assert_eq!(
            values(&events),
            vec![json!({"text": "a } b { c", "q": "say \"}\""}), json!({"n": 2})]
        );
    }

    #[test]
    fn test_ndjson() {
        let events = decode_all(Framing::Json, &["{\"n\":1}\n{\"n\"", ":2}\n"]);
        assert_eq!(values(&events), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_values_emitted_as_soon_as_complete() {
        let mut decoder = StreamDecoder::new(Framing::Json);
        assert!(decoder.feed(b"{\"a\":").is_empty());
        let events = decoder.feed(b"1}{\"b\"");
        assert_eq!(values(&events), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_incomplete_tail_yields_decode_failure() {
        let events = decode_all(Framing::Json, &[r#"{"a":1}{"b":"#]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Data(json!({"a": 1})));
        assert!(matches!(&events[1], StreamEvent::DecodeFailure { raw, .. } if raw == r#"{"b":"#));
    }

    #[test]
    fn test_trailing_scalar_gets_final_parse() {
        let events = decode_all(Framing::Json, &["{\"a\":1}\n42\n"]);
        assert_eq!(values(&events), vec![json!({"a": 1}), json!(42)]);
    }

    #[test]
    fn test_junk_between_values_is_reported() {
        let events = decode_all(Framing::Json, &["{\"a\":1} oops {\"b\":2}"]);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], StreamEvent::DecodeFailure { raw, .. } if raw == "oops"));
        assert_eq!(events[2], StreamEvent::Data(json!({"b": 2})));
    }

    #[test]
    fn test_balanced_but_malformed_value() {
        let events = decode_all(Framing::Json, &["{not json}{\"ok\":true}"]);
        assert!(matches!(events[0], StreamEvent::DecodeFailure { .. }));
        assert_eq!(events[1], StreamEvent::Data(json!({"ok": true})));
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let input = "{\"t\":\"héllo ✓\"}".as_bytes();
        let mut decoder = StreamDecoder::new(Framing::Json);
        let mut events = Vec::new();
        for byte in input {
            events.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        events.extend(decoder.finish());
        assert_eq!(values(&events), vec![json!({"t": "héllo ✓"})]);
    }

    #[test]
    fn test_event_stream_framing() {
        let events = decode_all(
            Framing::EventStream,
            &["data: {\"n\":1}\n\nda", "ta: {\"n\":2}\n\n", "data: [DONE]\n\n", "data: {\"n\":3}\n\n"],
        );
        assert_eq!(values(&events), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_event_stream_unterminated_tail() {
        let events = decode_all(Framing::EventStream, &["data: {\"n\":1}\n\ndata: {\"n\":2}"]);
        assert_eq!(values(&events), vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_event_stream_error_frame() {
        let events = decode_all(Framing::EventStream, &["event: error\ndata: upstream exploded\n\n"]);
        assert!(matches!(&events[0], StreamEvent::Error(RequestError::Stream { message }) if message == "upstream exploded"));
    }

    #[test]
    fn test_rate_limit_sentinel_ends_stream() {
        let events = decode_all(
            Framing::Json,
            &[r#"{"n":1}{"error":{"status":429,"retry_after":2}}{"n":2}"#],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Data(json!({"n": 1})),
                StreamEvent::RateLimited {
                    retry_after: Some(Duration::from_secs(2))
                },
            ]
        );
    }

    #[test]
    fn test_rate_limit_sentinel_in_sse_error_frame() {
        let events = decode_all(
            Framing::EventStream,
            &["event: error\ndata: {\"error\":{\"type\":\"rate_limit_error\"}}\n\n"],
        );
        assert_eq!(events, vec![StreamEvent::RateLimited { retry_after: None }]);
    }

    #[test]
    fn test_framing_from_content_type() {
        assert_eq!(
            Framing::from_content_type(Some("text/event-stream; charset=utf-8")),
            Framing::EventStream
        );
        assert_eq!(Framing::from_content_type(Some("application/x-ndjson")), Framing::Json);
        assert_eq!(Framing::from_content_type(None), Framing::Json);
    }

    #[tokio::test]
    async fn test_decode_stream_preserves_order() {
        let chunks = stream::iter(vec![
            Ok::<_, RequestError>("{\"i\":0}{\"i\"".to_string()),
            Ok(":1}".to_string()),
            Ok("{\"i\":2}".to_string()),
        ]);
        let events: Vec<StreamEvent> = decode_stream(chunks, Framing::Json, None).collect().await;
        assert_eq!(values(&events), vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})]);
    }

    #[tokio::test]
    async fn test_decode_stream_transport_error_is_single_event() {
        let chunks = stream::iter(vec![
            Ok("{\"i\":0}".to_string()),
            Err(RequestError::Stream {
                message: "reset".to_string(),
            }),
            Ok("{\"i\":1}".to_string()),
        ]);
        let events: Vec<StreamEvent> = decode_stream(chunks, Framing::Json, None).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_decode_stream_cancellation() {
        let token = CancellationToken::new();
        let chunks = stream::iter(vec![
            Ok::<_, RequestError>("{\"i\":0}".to_string()),
            Ok("{\"i\":1}".to_string()),
        ]);
        let mut events = decode_stream(chunks, Framing::Json, Some(token.clone()));

        assert_eq!(events.next().await, Some(StreamEvent::Data(json!({"i": 0}))));
        token.cancel();
        assert_eq!(events.next().await, Some(StreamEvent::Cancelled));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_chunk() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String, RequestError>>();
        tx.unbounded_send(Ok("{\"text\":\"partial\"}".to_string())).unwrap();

        let token = CancellationToken::new();
        let mut events = decode_stream(rx, Framing::Json, Some(token.clone()));
        assert_eq!(events.next().await, Some(StreamEvent::Data(json!({"text": "partial"}))));

        let cancel = token.clone();
        tokio::spawn(async move { cancel.cancel() });
        assert_eq!(events.next().await, Some(StreamEvent::Cancelled));
        assert_eq!(events.next().await, None);
        drop(tx);
    }
}
