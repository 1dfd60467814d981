//! SSE frame parsing.
//!
//! Upstream byte streams are parsed into whole SSE frames (one `data:` /
//! `event:` block each). Idle-cap enforcement lives in
//! [`crate::pipeline::PipelineStream`], which consumes these frames.

/// One server-sent event, reconstructed from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, when present (Anthropic names its frames).
    pub event: Option<String>,
    /// Joined `data:` payload (multi-line data joined with `\n`).
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// OpenAI's terminal sentinel.
    pub fn is_openai_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Anthropic's terminal event.
    pub fn is_anthropic_stop(&self) -> bool {
        self.event.as_deref() == Some("message_stop")
            || self.data.contains("\"type\":\"message_stop\"")
    }

    /// Serialize back to the wire form (terminated by the blank line).
    pub fn to_wire(&self) -> String {
        match &self.event {
            Some(event) => format!("event: {event}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

/// Incremental SSE parser. Feed raw bytes, collect completed frames.
#[derive(Default)]
pub struct FrameParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every frame completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut frames = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            if line.is_empty() {
                // Blank line terminates the frame.
                if !self.data_lines.is_empty() || self.event.is_some() {
                    frames.push(SseFrame {
                        event: self.event.take(),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment / keep-alive
            }
            if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Other fields (id:, retry:) are not used by either protocol here.
        }

        frames
    }

    /// Flush a trailing unterminated frame (stream ended without the blank
    /// line).
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() && self.event.is_none() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_data_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(frames, vec![SseFrame::data("{\"x\":1}")]);
    }

    #[test]
    fn parses_split_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: {\"par").is_empty());
        assert!(parser.feed(b"tial\":true}").is_empty());
        let frames = parser.feed(b"\n\n");
        assert_eq!(frames, vec![SseFrame::data("{\"partial\":true}")]);
    }

    #[test]
    fn parses_named_events() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
        assert!(frames[0].is_anthropic_stop());
    }

    #[test]
    fn skips_comments_and_keepalives() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b": keep-alive\n\ndata: real\n\n");
        assert_eq!(frames, vec![SseFrame::data("real")]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data: a\n\ndata: b\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 3);
        assert!(frames[2].is_openai_done());
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        assert_eq!(parser.finish(), Some(SseFrame::data("tail")));
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn wire_roundtrip() {
        let frame = SseFrame::named("content_block_delta", "{\"d\":1}");
        assert_eq!(
            frame.to_wire(),
            "event: content_block_delta\ndata: {\"d\":1}\n\n"
        );
        let mut parser = FrameParser::new();
        assert_eq!(parser.feed(frame.to_wire().as_bytes()), vec![frame]);
    }

}
