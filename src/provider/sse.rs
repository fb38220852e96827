//! Incremental decoder for provider-native SSE streams.
//!
//! Handles the `data: ` prefix, `[DONE]` termination, line buffering across
//! TCP chunk boundaries, `event:` lines (Anthropic names its events), and
//! empty keep-alive lines.

use serde_json::Value;

/// SSE stream decoder for upstream provider responses.
///
/// Feed raw bytes as they arrive; complete `data:` payloads come back as
/// parsed JSON. The `[DONE]` terminator and `event:`/comment lines are
/// consumed silently.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feed raw bytes into the decoder and return any complete JSON payloads.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(value) = Self::decode_line(line.trim()) {
                values.push(value);
            }
        }
        values
    }

    /// Flush any remaining buffer content after the stream ends.
    pub fn flush(&mut self) -> Vec<Value> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining
            .lines()
            .filter_map(|line| Self::decode_line(line.trim()))
            .collect()
    }

    fn decode_line(line: &str) -> Option<Value> {
        if line.is_empty() || line.starts_with("event:") || line.starts_with(':') {
            return None;
        }
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str::<Value>(data).ok()
    }
}
