//! Frame layer of the built-in stream transports (length + crc32c).
//!
//! The sync core itself consumes whole frames through the transport
//! abstraction; this module is only used by transports that run over a raw
//! byte stream (TCP, the in-memory test pair).

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length cannot be zero")]
    ZeroLength,
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected:#010x} got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

/// Prepend the length+crc header to a payload.
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::ZeroLength);
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental frame decoder. Feed it byte chunks as they arrive off the
/// stream; it yields complete verified payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Extract the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let length =
            u32::from_le_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if length == 0 {
            return Err(FrameError::ZeroLength);
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        if self.buffer.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }

        let expected =
            u32::from_le_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]);
        let payload: Vec<u8> = self
            .buffer
            .drain(..FRAME_HEADER_LEN + length)
            .skip(FRAME_HEADER_LEN)
            .collect();

        let got = crc32c(&payload);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_split_chunks() {
        let frame = encode_frame(b"hello sync", 1024).unwrap();
        let mut decoder = FrameDecoder::new(1024);

        let (a, b) = frame.split_at(5);
        decoder.push(a);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(b);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"hello sync");
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut bytes = encode_frame(b"one", 64).unwrap();
        bytes.extend(encode_frame(b"two", 64).unwrap());
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"one");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"two");
    }

    #[test]
    fn oversize_frame_rejected() {
        assert!(matches!(
            encode_frame(&[0u8; 32], 16),
            Err(FrameError::TooLarge { .. })
        ));
        let frame = encode_frame(&[0u8; 32], 64).unwrap();
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&frame);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut frame = encode_frame(b"payload", 64).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&frame);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }
}
