//! Server-Sent Events line decoding.
//!
//! Network chunks can end anywhere, including inside a multi-byte UTF-8
//! character, so bytes are buffered until a full line is available and only
//! then decoded.

/// Incremental decoder yielding the payload of each `data:` line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the `data:` payloads of every completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = Self::data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        Self::data_payload(&rest)
    }

    fn data_payload(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\n', '\r']);

        // Blank separators and `:` comments carry nothing
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        let data = line.strip_prefix("data:")?;
        Some(data.strip_prefix(' ').unwrap_or(data).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_data_lines_only() {
        let mut decoder = SseDecoder::new();
        let out = decoder.push(b": keepalive\nevent: message\ndata: {\"a\":1}\n\ndata:[DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn holds_partial_lines_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: hel").is_empty());
        assert_eq!(decoder.push(b"lo\r\n"), vec!["hello".to_string()]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let text = "data: caf\u{e9} \u{1F600}\n".as_bytes();
        // Split inside the four-byte emoji
        let (a, b) = text.split_at(text.len() - 3);
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec!["caf\u{e9} \u{1F600}".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: tail");
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert!(decoder.finish().is_none());
    }
}
