// ABOUTME: Decoder for Docker's multiplexed attach/exec stream framing
// Each frame is an 8-byte header (stream type, three zero bytes, big-endian u32 length) plus payload

use thiserror::Error;

/// Size of the per-frame multiplexing header
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One decoded unit of output. `stream` is `None` for raw (TTY) output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: Option<StreamKind>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame header: stream byte {0:#04x}")]
    InvalidHeader(u8),
    #[error("stream ended inside a frame: expected {expected} payload bytes, got {received}")]
    Truncated { expected: usize, received: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Detect,
    Multiplexed,
    Raw,
}

/// Whether `bytes` starts with a well-formed multiplexing header.
pub fn looks_multiplexed(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN
        && StreamKind::from_byte(bytes[0]).is_some()
        && bytes[1..4] == [0, 0, 0]
}

/// Incremental decoder: chunks may split frames and headers at any byte.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    mode: Mode,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buffer.extend_from_slice(chunk);

        if self.mode == Mode::Detect {
            match self.buffer.first() {
                None => return Ok(Vec::new()),
                Some(&first) if StreamKind::from_byte(first).is_none() => self.mode = Mode::Raw,
                Some(_) if self.buffer.len() < HEADER_LEN => return Ok(Vec::new()),
                Some(_) => {
                    self.mode = if looks_multiplexed(&self.buffer) {
                        Mode::Multiplexed
                    } else {
                        Mode::Raw
                    };
                }
            }
        }

        match self.mode {
            Mode::Raw => Ok(self.take_raw().into_iter().collect()),
            Mode::Multiplexed => self.decode_frames(),
            Mode::Detect => Ok(Vec::new()),
        }
    }

    /// Flush at end of stream. Leftover bytes inside a multiplexed frame are an error.
    pub fn finish(mut self) -> Result<Option<Frame>, FrameError> {
        match self.mode {
            Mode::Multiplexed if !self.buffer.is_empty() => {
                if self.buffer.len() < HEADER_LEN {
                    return Err(FrameError::Truncated {
                        expected: HEADER_LEN,
                        received: self.buffer.len(),
                    });
                }
                Err(FrameError::Truncated {
                    expected: payload_len(&self.buffer),
                    received: self.buffer.len() - HEADER_LEN,
                })
            }
            Mode::Multiplexed => Ok(None),
            Mode::Raw | Mode::Detect => Ok(self.take_raw()),
        }
    }

    fn take_raw(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(Frame {
            stream: None,
            payload: std::mem::take(&mut self.buffer),
        })
    }

    fn decode_frames(&mut self) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while self.buffer.len() - offset >= HEADER_LEN {
            let header = &self.buffer[offset..offset + HEADER_LEN];
            let stream =
                StreamKind::from_byte(header[0]).ok_or(FrameError::InvalidHeader(header[0]))?;
            let len = payload_len(header);
            let end = offset + HEADER_LEN + len;
            if self.buffer.len() < end {
                break;
            }
            frames.push(Frame {
                stream: Some(stream),
                payload: self.buffer[offset + HEADER_LEN..end].to_vec(),
            });
            offset = end;
        }

        self.buffer.drain(..offset);
        Ok(frames)
    }
}

fn payload_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Strip all headers from a complete buffer and concatenate the payloads.
    fn demultiplex(bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut decoder = FrameDecoder::new();
        let mut output = Vec::with_capacity(bytes.len());
        for frame in decoder.push(bytes)? {
            output.extend_from_slice(&frame.payload);
        }
        if let Some(frame) = decoder.finish()? {
            output.extend_from_slice(&frame.payload);
        }
        Ok(output)
    }

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream, 0, 0, 0];
        bytes.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut bytes = frame(1, b"hello ");
        bytes.extend(frame(2, b"oops\n"));
        bytes.extend(frame(1, b"world\n"));

        assert_eq!(demultiplex(&bytes).unwrap(), b"hello oops\nworld\n");
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let bytes = frame(1, b"split payload");
        let mut decoder = FrameDecoder::new();

        // header split in the middle, payload split again
        assert!(decoder.push(&bytes[..3]).unwrap().is_empty());
        assert!(decoder.push(&bytes[3..12]).unwrap().is_empty());
        let frames = decoder.push(&bytes[12..]).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream, Some(StreamKind::Stdout));
        assert_eq!(frames[0].payload, b"split payload");
        assert_eq!(decoder.finish().unwrap(), None);
    }

    #[test]
    fn test_payload_shorter_than_header_is_kept() {
        // the naive "skip 8 bytes per chunk" approach drops short frames entirely
        let mut bytes = frame(1, b"a");
        bytes.extend(frame(1, b"b"));
        assert_eq!(demultiplex(&bytes).unwrap(), b"ab");
    }

    #[test]
    fn test_raw_tty_output_passes_through() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"$ ls\r\nfile.txt\r\n").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream, None);
        assert_eq!(frames[0].payload, b"$ ls\r\nfile.txt\r\n");
    }

    #[test]
    fn test_truncated_frame_reported() {
        let bytes = frame(1, b"complete payload");
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..bytes.len() - 4]).unwrap();
        assert_eq!(
            decoder.finish(),
            Err(FrameError::Truncated {
                expected: 16,
                received: 12
            })
        );
    }

    #[test]
    fn test_invalid_header_after_valid_frame() {
        let mut bytes = frame(1, b"ok");
        bytes.extend([7, 0, 0, 0, 0, 0, 0, 1, b'x']);
        assert_eq!(demultiplex(&bytes), Err(FrameError::InvalidHeader(7)));
    }

    #[test]
    fn test_looks_multiplexed() {
        assert!(looks_multiplexed(&frame(2, b"err")));
        assert!(!looks_multiplexed(b"plain text"));
        assert!(!looks_multiplexed(&[1, 0, 0]));
    }
}
