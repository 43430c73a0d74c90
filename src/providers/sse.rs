//! Incremental decoder for server-sent event streams.
//!
//! Provider responses arrive as network chunks that cut frames at
//! arbitrary byte positions, so the decoder is stateful: feed it raw
//! chunks as they come off the wire and it yields only frames whose
//! terminating blank line has arrived. Partial trailing data stays
//! buffered for the next feed, which means a frame is decoded exactly
//! once, never re-parsed half-complete. Call [`SseDecoder::finish`] at end
//! of stream to flush a final frame that lacked its terminator.

use serde_json::Value;

/// One decoded frame. `data` is the parsed JSON payload, or `None` for
/// the `[DONE]` end-of-stream sentinel and unparseable payloads.
#[derive(Debug)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a raw chunk and return every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();
        while let Some((end, skip)) = next_boundary(&self.buf) {
            let rest = self.buf.split_off(end + skip);
            let block = std::mem::replace(&mut self.buf, rest);
            if let Some(frame) = decode_block(&block[..end]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush whatever is still buffered as a final frame. Streams that end
    /// cleanly on a blank line have nothing left here.
    pub fn finish(self) -> Option<SseFrame> {
        decode_block(&self.buf)
    }
}

/// Position of the earliest frame terminator (blank line), with its width.
fn next_boundary(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|i| (i, 2));
    let crlf = buf.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (found, None) | (None, found) => found,
    }
}

/// Decode one frame block. Fields other than `event:` and `data:` (ids,
/// retry hints, `:` keepalive comments) are ignored; frames carrying no
/// data at all are dropped since no caller can act on them.
fn decode_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let raw = data_lines.join("\n");
    let raw = raw.trim();
    let data = if raw == "[DONE]" {
        None
    } else {
        serde_json::from_str(raw).ok()
    };
    Some(SseFrame { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks_decodes_once() {
        let mut decoder = SseDecoder::new();
        // The frame terminator hasn't arrived yet: nothing comes out, and
        // nothing is parsed prematurely.
        let frames = decoder.feed(b"event: content_block_delta\ndata: {\"seq\":");
        assert!(frames.is_empty());

        let frames = decoder.feed(b" 1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(frames[0].data.as_ref().unwrap()["seq"], 1);
    }

    #[test]
    fn one_chunk_can_complete_several_frames() {
        let mut decoder = SseDecoder::new();
        let frames =
            decoder.feed(b"data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: {\"n\":3}\n\ndata: {\"n\":");
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.data.as_ref().unwrap()["n"], i as i64 + 1);
        }
        // The fourth frame is still pending.
        assert_eq!(decoder.feed(b"4}\n\n").len(), 1);
    }

    #[test]
    fn done_sentinel_yields_frame_without_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: [DONE]\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.is_none());
    }

    #[test]
    fn multiline_data_joined_before_parsing() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_ref().unwrap()["a"], 1);
    }

    #[test]
    fn finish_flushes_unterminated_trailing_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"tail\":true}").is_empty());
        let frame = decoder.finish().expect("trailing frame");
        assert_eq!(frame.data.unwrap()["tail"], true);
    }

    #[test]
    fn finish_on_clean_stream_is_empty() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {\"x\":1}\n\n");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn crlf_terminators_accepted() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: ping\r\ndata: {\"ok\":true}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
        assert_eq!(frames[0].data.as_ref().unwrap()["ok"], true);
    }

    #[test]
    fn keepalives_and_unknown_fields_skipped() {
        let mut decoder = SseDecoder::new();
        // A lone comment frame produces nothing.
        assert!(decoder.feed(b": keepalive\n\n").is_empty());
        // Ids and retry hints around the data don't disturb it.
        let frames = decoder.feed(b"id: 7\nretry: 3000\ndata: {\"v\":2}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_ref().unwrap()["v"], 2);
    }
}
