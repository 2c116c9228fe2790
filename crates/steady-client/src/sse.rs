//! Server-Sent Events framing.
//!
//! Lines may be split across transport chunks, so text is buffered until a
//! full line is available. An event is dispatched on a blank line; a trailing
//! event with no terminating blank line is recovered by [`SseParser::finish`].

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The event type (from "event:" lines)
    pub event: Option<String>,
    /// Joined "data:" lines
    pub data: String,
}

impl SseEvent {
    /// `data: [DONE]` terminates a stream.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// `event: error` frames carry a failure payload.
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and return every event completed by it.
    pub fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                events.extend(self.dispatch());
            } else {
                self.apply_line(line);
            }
        }
        events
    }

    /// Flush any partial line and undispatched event at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.apply_line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn apply_line(&mut self, line: &str) {
        // Comment lines start with ':'
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry are reconnection hints; streams are never resumed
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }

        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
