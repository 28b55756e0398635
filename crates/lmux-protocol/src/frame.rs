//! Incremental framing for the two streaming wire shapes the gateway sees:
//! SSE (`event:`/`data:` records separated by a blank line) and NDJSON (one
//! JSON object per line). Parsers are push-based; callers feed raw body
//! chunks as they arrive and receive completed frames.

use bytes::Bytes;
use serde::Serialize;

/// OpenAI-style terminal sentinel on SSE data streams.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw body chunk; returns every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.consume_line(line, &mut out);
        }
        out
    }

    /// Flush whatever is buffered at end-of-stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.consume_line(line.trim_end_matches('\r'), &mut out);
        }
        self.flush_record(&mut out);
        out
    }

    fn consume_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_record(out);
            return;
        }
        // Comment lines keep the connection alive; nothing to surface.
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending_event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.pending_data.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_record(&mut self, out: &mut Vec<SseEvent>) {
        if self.pending_event.is_none() && self.pending_data.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.pending_event.take(),
            data: self.pending_data.join("\n"),
        });
        self.pending_data.clear();
    }
}

#[derive(Debug, Default)]
pub struct NdjsonParser {
    buffer: String,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();
            if !line.is_empty() {
                out.push(line.to_string());
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![rest.to_string()]
        }
    }
}

/// Encode a bare `data:` SSE record.
pub fn sse_data<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(b"\n\n");
    Some(Bytes::from(frame))
}

/// Encode a named-event SSE record (`event:` + `data:`).
pub fn sse_named<T: Serialize>(event: &str, value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut frame = Vec::with_capacity(payload.len() + event.len() + 16);
    frame.extend_from_slice(b"event: ");
    frame.extend_from_slice(event.as_bytes());
    frame.extend_from_slice(b"\ndata: ");
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(b"\n\n");
    Some(Bytes::from(frame))
}

/// The `data: [DONE]` terminator.
pub fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Encode one NDJSON line.
pub fn ndjson_line<T: Serialize>(value: &T) -> Option<Bytes> {
    let mut payload = serde_json::to_vec(value).ok()?;
    payload.push(b'\n');
    Some(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_records_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: message_start\nda").is_empty());
        let events = parser.push(b"ta: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn sse_multiline_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn sse_comments_and_crlf_ignored() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keepalive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn done_sentinel_detected() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: [DONE]\n\n");
        assert!(events[0].is_done());
    }

    #[test]
    fn ndjson_lines_drain_incrementally() {
        let mut parser = NdjsonParser::new();
        assert!(parser.push(b"{\"a\":").is_empty());
        let lines = parser.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(parser.finish(), vec!["{\"c\""]);
    }

    #[test]
    fn sse_finish_flushes_unterminated_record() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events[0].data, "tail");
    }
}
