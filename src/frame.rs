//! Line Framer (C1): reassembles newline-delimited JSON records out of
//! arbitrary byte chunks, per spec §4.1.

use crate::error::{Result, SdkError};
use crate::types::Record;

/// Default frame buffer ceiling (spec §6): 1 MiB.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024;

/// Accumulates partial reads into complete JSON records.
///
/// The peer emits one JSON object per logical line but may split a large
/// object across multiple physical reads, or pack more than one object into
/// a single read. Try-decode-then-accumulate after each newline-delimited
/// piece handles both cases without assuming either framing is exclusive.
pub struct LineFramer {
    buffer: String,
    max_bytes: usize,
    done: bool,
}

impl LineFramer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_bytes,
            done: false,
        }
    }

    /// Feed one chunk of bytes read from the transport; returns every
    /// complete record decoded as a result of this chunk, in order.
    ///
    /// Once this returns `Err(BufferOverflow)`, the framer is done: further
    /// calls return the same error without attempting to decode anything
    /// (spec §4.1 step 3, "the framer is then done").
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Record>> {
        if self.done {
            return Err(SdkError::BufferOverflow {
                limit: self.max_bytes,
            });
        }

        let mut out = Vec::new();
        for piece in chunk.split(|&b| b == b'\n') {
            let piece = trim_ascii_whitespace(piece);
            if piece.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(piece);
            self.buffer.push_str(&text);

            if self.buffer.len() > self.max_bytes {
                self.done = true;
                return Err(SdkError::BufferOverflow {
                    limit: self.max_bytes,
                });
            }

            match serde_json::from_str::<Record>(&self.buffer) {
                Ok(value) => {
                    out.push(value);
                    self.buffer.clear();
                }
                Err(_) => {
                    // Incomplete object (or a genuinely malformed one we'll
                    // keep accumulating into until it overflows); the spec
                    // treats decode failure as "assume incomplete" and keeps
                    // accumulating rather than surfacing a DecodeError here.
                }
            }
        }
        Ok(out)
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn multiple_objects_on_one_line() {
        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_BYTES);
        let records = framer
            .feed(b"{\"type\":\"a\"}\n{\"type\":\"b\"}")
            .unwrap();
        assert_eq!(records, vec![json!({"type": "a"}), json!({"type": "b"})]);
    }

    #[test]
    fn split_object_across_chunks() {
        let object = json!({"type": "x", "payload": "a".repeat(860)});
        let serialized = serde_json::to_string(&object).unwrap();
        assert_eq!(serialized.len(), 900);

        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_BYTES);
        let (c1, rest) = serialized.split_at(100);
        let (c2, c3) = rest.split_at(150);

        assert!(framer.feed(c1.as_bytes()).unwrap().is_empty());
        assert!(framer.feed(c2.as_bytes()).unwrap().is_empty());
        let records = framer.feed(c3.as_bytes()).unwrap();
        assert_eq!(records, vec![object]);
    }

    #[test]
    fn buffer_overflow_reports_configured_limit() {
        let mut framer = LineFramer::new(512);
        let payload = json!({"type": "x", "payload": "a".repeat(580)});
        let serialized = serde_json::to_string(&payload).unwrap();
        assert_eq!(serialized.len(), 612);

        let err = framer.feed(serialized.as_bytes()).unwrap_err();
        match err {
            SdkError::BufferOverflow { limit } => assert_eq!(limit, 512),
            other => panic!("expected BufferOverflow, got {other:?}"),
        }

        // Framer is done: a subsequent feed reports the same error instead
        // of trying to decode anything further.
        let err2 = framer.feed(b"{}").unwrap_err();
        assert!(matches!(err2, SdkError::BufferOverflow { limit: 512 }));
    }

    #[test]
    fn whitespace_only_fragments_are_skipped() {
        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_BYTES);
        let records = framer.feed(b"   \n\t\n{\"type\":\"a\"}\n  ").unwrap();
        assert_eq!(records, vec![json!({"type": "a"})]);
    }

    #[test]
    fn ordering_is_preserved_across_many_records() {
        let mut framer = LineFramer::new(DEFAULT_MAX_BUFFER_BYTES);
        let mut chunk = String::new();
        for i in 0..50 {
            chunk.push_str(&format!("{{\"type\":\"t\",\"n\":{i}}}\n"));
        }
        let records = framer.feed(chunk.as_bytes()).unwrap();
        assert_eq!(records.len(), 50);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record["n"], i);
        }
    }
}
