//! Frame sniffing for upstream stream bodies. Providers answer with SSE or
//! NDJSON; the first bytes decide which framing applies and everything after
//! flows through the chosen parser.

use bytes::Bytes;

use lmux_protocol::frame::{NdjsonParser, SseParser};

#[derive(Debug)]
enum Framing {
    Undetected(String),
    Sse(SseParser),
    Ndjson(NdjsonParser),
}

#[derive(Debug)]
pub struct FrameSniffer {
    framing: Framing,
}

impl Default for FrameSniffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSniffer {
    pub fn new() -> Self {
        Self {
            framing: Framing::Undetected(String::new()),
        }
    }

    /// Feed a body chunk; returns completed frame payloads (SSE `data:`
    /// values or NDJSON lines).
    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        match &mut self.framing {
            Framing::Undetected(pending) => {
                let Ok(text) = std::str::from_utf8(chunk) else {
                    return Vec::new();
                };
                pending.push_str(text);
                let combined = std::mem::take(pending);
                let Some(first) = combined.chars().find(|c| !c.is_whitespace()) else {
                    *pending = combined;
                    return Vec::new();
                };
                if first == '{' || first == '[' {
                    let mut parser = NdjsonParser::new();
                    let frames = parser.push(combined.as_bytes());
                    self.framing = Framing::Ndjson(parser);
                    frames
                        .into_iter()
                        .map(|line| strip_array_framing(&line))
                        .filter(|line| !line.is_empty())
                        .collect()
                } else {
                    let mut parser = SseParser::new();
                    let events = parser.push(combined.as_bytes());
                    self.framing = Framing::Sse(parser);
                    events
                        .into_iter()
                        .filter(|event| !event.data.is_empty())
                        .map(|event| event.data)
                        .collect()
                }
            }
            Framing::Sse(parser) => parser
                .push(chunk)
                .into_iter()
                .filter(|event| !event.data.is_empty())
                .map(|event| event.data)
                .collect(),
            Framing::Ndjson(parser) => parser
                .push(chunk)
                .into_iter()
                .map(|line| strip_array_framing(&line))
                .filter(|line| !line.is_empty())
                .collect(),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.framing {
            Framing::Undetected(pending) => {
                let rest = pending.trim().to_string();
                pending.clear();
                if rest.is_empty() { Vec::new() } else { vec![rest] }
            }
            Framing::Sse(parser) => parser
                .finish()
                .into_iter()
                .filter(|event| !event.data.is_empty())
                .map(|event| event.data)
                .collect(),
            Framing::Ndjson(parser) => parser
                .finish()
                .into_iter()
                .map(|line| strip_array_framing(&line))
                .filter(|line| !line.is_empty())
                .collect(),
        }
    }
}

// Some upstreams stream a JSON array one element per line; drop the bracket
// and comma framing so each line is a bare object.
fn strip_array_framing(line: &str) -> String {
    let line = line.trim();
    let line = line.strip_prefix('[').unwrap_or(line);
    let line = line.strip_suffix(']').unwrap_or(line);
    let line = line.strip_prefix(',').unwrap_or(line);
    let line = line.strip_suffix(',').unwrap_or(line);
    line.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_sse_from_data_prefix() {
        let mut sniffer = FrameSniffer::new();
        let frames = sniffer.push(&Bytes::from_static(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n"));
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn sniffs_ndjson_from_brace() {
        let mut sniffer = FrameSniffer::new();
        let frames = sniffer.push(&Bytes::from_static(b"{\"a\":1}\n{\"b\":2}\n"));
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn json_array_lines_are_unwrapped() {
        let mut sniffer = FrameSniffer::new();
        let frames = sniffer.push(&Bytes::from_static(b"[{\"a\":1},\n{\"b\":2}]\n"));
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn detection_survives_chunk_splits() {
        let mut sniffer = FrameSniffer::new();
        assert!(sniffer.push(&Bytes::from_static(b"da")).is_empty());
        let frames = sniffer.push(&Bytes::from_static(b"ta: {\"x\":1}\n\n"));
        assert_eq!(frames, vec!["{\"x\":1}"]);
    }
}
