// Incremental server-sent events parser

use bytes::BytesMut;

/// Longest line kept; anything longer is dropped
pub const MAX_LINE_LEN: usize = 256 * 1024;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name, `message` when the server sent none
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream
    pub id: Option<String>,
    /// Reconnection time requested by the server, in milliseconds
    pub retry: Option<u64>,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }
}

/// Parses `text/event-stream` bytes into frames.
///
/// Chunks may split lines (or UTF-8 sequences) anywhere; incomplete lines
/// stay buffered until the next `feed`.
#[derive(Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
    /// Inside an oversized line whose start was already thrown away
    discarding: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and return every frame they complete
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((line_len, terminator_len)) = find_line_end(&self.buffer) {
            let raw = self.buffer.split_to(line_len + terminator_len);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line_len > MAX_LINE_LEN {
                tracing::warn!(bytes = line_len, "Dropping oversized event stream line");
                continue;
            }
            let line = String::from_utf8_lossy(&raw[..line_len]);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > MAX_LINE_LEN {
            tracing::warn!(
                bytes = self.buffer.len(),
                "Event stream line exceeds limit, discarding until next line break"
            );
            // A trailing CR may be half of the terminator
            let held_cr = self.buffer.last() == Some(&b'\r');
            self.buffer.clear();
            if held_cr {
                self.buffer.extend_from_slice(b"\r");
            }
            self.discarding = true;
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }

        // Comment
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);

        if event.is_none() && data.is_empty() {
            return None;
        }

        Some(SseFrame {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
            id: self.last_id.clone(),
            retry: self.retry.take(),
        })
    }
}

/// Position and terminator length of the first complete line.
/// A trailing `\r` is held back until we know whether `\n` follows.
fn find_line_end(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, byte) in buf.iter().enumerate() {
        match byte {
            b'\n' => return Some((i, 1)),
            b'\r' => {
                return match buf.get(i + 1) {
                    Some(b'\n') => Some((i, 2)),
                    Some(_) => Some((i, 1)),
                    None => None,
                };
            }
            _ => {}
        }
    }
    None
}
