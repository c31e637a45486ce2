//! Server-sent events framing.
//!
//! The push channel is a `text/event-stream` body: frames are separated by
//! a blank line and each frame is a set of `field: value` lines. Network
//! chunks do not respect frame (or UTF-8) boundaries, so [`FrameDecoder`]
//! buffers raw bytes until a full frame is available.

/// One parsed event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, if the server named the event.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
    /// `id:` field.
    pub id: Option<String>,
    /// `retry:` reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

impl SseFrame {
    /// Frame carrying only a data payload.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Parse a single frame block (without the terminating blank line).
    ///
    /// Returns `None` for blocks with no data, such as keep-alive comments.
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Option<String> = None;
        let mut id = None;
        let mut retry = None;

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => match data.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                "id" => id = Some(value.to_string()),
                "retry" => retry = value.parse().ok(),
                other => tracing::trace!(field = other, "Ignoring unknown SSE field"),
            }
        }

        data.map(|data| Self {
            event,
            data,
            id,
            retry,
        })
    }
}

/// Incremental splitter turning arbitrary byte chunks into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer
            .extend(chunk.iter().copied().filter(|&b| b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&block[..end]);
            if let Some(frame) = SseFrame::parse(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes received but not yet terminated by a blank line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_frame() {
        let frame = SseFrame::parse("event: message\nid: 123\nretry: 3000\ndata: hello").unwrap();
        assert_eq!(frame.event.as_deref(), Some("message"));
        assert_eq!(frame.id.as_deref(), Some("123"));
        assert_eq!(frame.retry, Some(3000));
        assert_eq!(frame.data, "hello");
    }

    #[test]
    fn multiline_data_is_joined() {
        let frame = SseFrame::parse("data: line 1\ndata: line 2").unwrap();
        assert_eq!(frame.data, "line 1\nline 2");
    }

    #[test]
    fn comment_only_block_has_no_frame() {
        assert!(SseFrame::parse(": keep-alive").is_none());
    }

    #[test]
    fn data_colons_are_preserved() {
        let frame = SseFrame::parse(r#"data: {"a":"b:c"}"#).unwrap();
        assert_eq!(frame.data, r#"{"a":"b:c"}"#);
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(b"data: {\"job_").is_empty());
        assert!(decoder.push(b"id\":\"1\"}\n").is_empty());
        let frames = decoder.push(b"\ndata: second\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, r#"{"job_id":"1"}"#);
        assert_eq!(frames[1].data, "second");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_normalises_crlf() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(b"data: a\r\n\r\n: ping\r\n\r\ndata: b\r\n\r\n");
        let data: Vec<_> = frames.into_iter().map(|f| f.data).collect();
        assert_eq!(data, vec!["a", "b"]);
    }

    #[test]
    fn decoder_keeps_multibyte_characters_across_chunks() {
        let mut decoder = FrameDecoder::default();
        let bytes = "data: résumé\n\n".as_bytes();
        let (head, tail) = bytes.split_at(8);
        assert!(decoder.push(head).is_empty());
        let frames = decoder.push(tail);
        assert_eq!(frames[0].data, "résumé");
    }
}
