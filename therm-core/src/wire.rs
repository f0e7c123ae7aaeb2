//! Framing: payload bytes + one sentinel byte (`$`), written in fixed-size chunks.
//!
//! The same byte doubles as the leading control marker of Suite-to-Tool commands
//! (`$trialstart,...$`). The decoder tells them apart by position: a sentinel that
//! arrives while no message is pending opens a marked message, any later one ends it.

/// End-of-message byte, also the leading control marker.
pub const SENTINEL: u8 = b'$';

/// Maximum bytes per socket write.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on an unterminated message before the stream is considered broken.
pub const MAX_PENDING_LEN: usize = 64 * 1024;

/// Encode a payload into chunks of at most `CHUNK_SIZE` bytes; the last chunk ends with the sentinel.
pub fn encode_frame(payload: &str) -> Result<Vec<Vec<u8>>, FrameEncodeError> {
    encode_frame_with_chunk_size(payload, CHUNK_SIZE)
}

/// Like `encode_frame` with an explicit chunk size. Zero selects `CHUNK_SIZE`.
pub fn encode_frame_with_chunk_size(
    payload: &str,
    chunk_size: usize,
) -> Result<Vec<Vec<u8>>, FrameEncodeError> {
    let bytes = payload.as_bytes();
    if bytes.is_empty() {
        return Err(FrameEncodeError::Empty);
    }
    if let Some(pos) = bytes.iter().skip(1).position(|&b| b == SENTINEL) {
        return Err(FrameEncodeError::SentinelInPayload(pos + 1));
    }
    let size = if chunk_size == 0 { CHUNK_SIZE } else { chunk_size };
    let mut framed = Vec::with_capacity(bytes.len() + 1);
    framed.extend_from_slice(bytes);
    framed.push(SENTINEL);
    Ok(framed.chunks(size).map(<[u8]>::to_vec).collect())
}

/// Error encoding a payload into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("empty payload")]
    Empty,
    #[error("sentinel byte inside payload at offset {0}")]
    SentinelInPayload(usize),
}

/// Error decoding the byte stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("no sentinel within {limit} bytes")]
    Overflow { limit: usize },
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
}

/// Stream reassembler. Keeps the bytes after the last sentinel until the next `feed`.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    limit: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING_LEN)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    /// Append `bytes` and return every message completed by them, in stream order.
    /// On error the pending buffer is discarded; the caller should drop the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, FrameDecodeError> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == SENTINEL && !self.pending.is_empty() {
                let raw = std::mem::take(&mut self.pending);
                let text = String::from_utf8(raw).map_err(|_| FrameDecodeError::InvalidUtf8)?;
                out.push(text);
                continue;
            }
            if self.pending.len() >= self.limit {
                self.pending.clear();
                return Err(FrameDecodeError::Overflow { limit: self.limit });
            }
            self.pending.push(b);
        }
        Ok(out)
    }

    /// Bytes of the message currently being reassembled.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn concat(chunks: &[Vec<u8>]) -> Vec<u8> {
        chunks.iter().flatten().copied().collect()
    }

    #[test]
    fn roundtrip_report() {
        let chunks = encode_frame("response,1,1,3,yes").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], b"response,1,1,3,yes$");
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(&chunks[0]).unwrap(), vec!["response,1,1,3,yes"]);
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn control_marker_is_kept() {
        let chunks = encode_frame("$trialstart,7,3,1500").unwrap();
        assert_eq!(concat(&chunks), b"$trialstart,7,3,1500$");
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(&concat(&chunks)).unwrap(), vec!["$trialstart,7,3,1500"]);
    }

    #[test]
    fn partial_read_retains_prefix() {
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(b"$trial").unwrap().is_empty());
        assert_eq!(dec.pending_len(), 6);
        assert!(dec.feed(b"start,1,1,").unwrap().is_empty());
        assert_eq!(dec.feed(b"2000$next").unwrap(), vec!["$trialstart,1,1,2000"]);
        assert_eq!(dec.feed(b"trial$").unwrap(), vec!["nexttrial"]);
    }

    #[test]
    fn multiple_messages() {
        let mut dec = FrameDecoder::new();
        let out = dec.feed(b"$experimentend$nexttrial$$trialstart,1,2,300$").unwrap();
        assert_eq!(out, vec!["$experimentend", "nexttrial", "$trialstart,1,2,300"]);
    }

    #[test]
    fn chunks_respect_size() {
        let payload = "a".repeat(CHUNK_SIZE * 2);
        let chunks = encode_frame(&payload).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        assert_eq!(chunks[2], b"$");
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let chunks = encode_frame_with_chunk_size("abc", 0).unwrap();
        assert_eq!(chunks, vec![b"abc$".to_vec()]);
    }

    #[test]
    fn rejects_empty_and_embedded_sentinel() {
        assert_eq!(encode_frame(""), Err(FrameEncodeError::Empty));
        assert_eq!(
            encode_frame("cost,$5"),
            Err(FrameEncodeError::SentinelInPayload(5))
        );
    }

    #[test]
    fn overflow_without_sentinel() {
        let mut dec = FrameDecoder::with_limit(8);
        assert!(dec.feed(b"12345678").unwrap().is_empty());
        assert_eq!(
            dec.feed(b"9"),
            Err(FrameDecodeError::Overflow { limit: 8 })
        );
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn invalid_utf8() {
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.feed(&[0xff, 0xfe, SENTINEL]), Err(FrameDecodeError::InvalidUtf8));
    }

    proptest! {
        #[test]
        fn byte_at_a_time_matches_payload(payload in "[^$]{1,200}", size in 1usize..64) {
            let chunks = encode_frame_with_chunk_size(&payload, size).unwrap();
            let mut dec = FrameDecoder::new();
            let mut out = Vec::new();
            for b in concat(&chunks) {
                out.extend(dec.feed(&[b]).unwrap());
            }
            prop_assert_eq!(out, vec![payload]);
        }

        #[test]
        fn concatenated_equals_individual(payloads in proptest::collection::vec("[^$]{1,40}", 1..8)) {
            let mut all = Vec::new();
            for p in &payloads {
                all.extend(concat(&encode_frame(p).unwrap()));
            }
            let mut one_shot = FrameDecoder::new();
            let joined = one_shot.feed(&all).unwrap();

            let mut separate = FrameDecoder::new();
            let mut individual = Vec::new();
            for p in &payloads {
                individual.extend(separate.feed(&concat(&encode_frame(p).unwrap())).unwrap());
            }
            prop_assert_eq!(&joined, &individual);
            prop_assert_eq!(joined, payloads);
        }
    }
}
