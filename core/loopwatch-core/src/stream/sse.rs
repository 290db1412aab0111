//! Incremental `text/event-stream` decoder.
//!
//! Fields handled: `event`, `data` (multi-line, joined with `\n`), `id` and
//! `retry`. Lines starting with `:` are comments. A blank line dispatches
//! the pending frame; a frame without any `data` line is discarded. Line
//! terminators may be `\n`, `\r\n` or `\r`, and may straddle chunks.

const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    skip_lf: bool,
    event: String,
    data: Vec<String>,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if self.skip_lf {
                self.skip_lf = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.finish_line(&mut frames),
                b'\r' => {
                    self.finish_line(&mut frames);
                    self.skip_lf = true;
                }
                _ => self.line.push(byte),
            }
        }
        frames
    }

    /// Last `id:` seen, kept across frames as the resume cursor.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn take_retry(&mut self) -> Option<u64> {
        self.retry_ms.take()
    }

    fn finish_line(&mut self, frames: &mut Vec<SseFrame>) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if let Some(frame) = self.process_line(&line) {
            frames.push(frame);
        }
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(index) => {
                let value = &line[index + 1..];
                (&line[..index], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = std::mem::take(&mut self.event);
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();

        Some(SseFrame {
            event: if event.is_empty() {
                DEFAULT_EVENT.to_string()
            } else {
                event
            },
            data,
            id: self.last_event_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: text\ndata: {\"content\":\"hi\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "text".to_string(),
                data: "{\"content\":\"hi\"}".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn frame_split_across_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: status\r").is_empty());
        assert!(decoder.feed(b"\ndata: {\"status\":").is_empty());
        let frames = decoder.feed(b"\"running\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "status");
        assert_eq!(frames[0].data, "{\"status\":\"running\"}");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: first\ndata: second\n\n");
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "first\nsecond");
    }

    #[test]
    fn comments_and_dataless_frames_are_dropped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": keepalive\n\nevent: heartbeat\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn event_name_does_not_leak_into_next_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: error\n\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn tracks_last_event_id_and_retry() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"id: 41\nretry: 1500\ndata: {}\n\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].id.as_deref(), Some("41"));
        assert_eq!(decoder.last_event_id(), Some("41"));
        assert_eq!(decoder.take_retry(), Some(1500));
        assert_eq!(decoder.take_retry(), None);
    }
}
