//! Accumulates partial socket reads into complete frames.
//!
//! One [`FrameReassembler`] lives per connection. Reads land in the spare
//! tail of a growable buffer; once the header is in, the required frame length
//! is known and the buffer grows in steps of `min(capacity / 2, 2048)` until it
//! can hold the frame. Completed frames are decoded and the remaining bytes
//! shifted to the front.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::datagram::{self, Datagram, FrameError, HEAD_LENGTH, MAX_FRAME_LENGTH};

/// Initial buffer capacity when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Largest single growth step.
const MAX_GROWTH_STEP: usize = 2048;

/// Configuration for [`FrameReassembler`].
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Starting buffer capacity. Raised to the header length if smaller.
    pub initial_capacity: usize,
    /// Maximum total frame size; also the hard cap on buffer growth.
    pub max_frame_size: usize,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_LENGTH,
        }
    }
}

/// Per-connection frame reassembly state.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    written: usize,
    required: Option<usize>,
    max_frame_size: usize,
}

impl FrameReassembler {
    /// Create a reassembler with the given configuration.
    pub fn new(config: &ReassemblerConfig) -> Self {
        let max_frame_size = config.max_frame_size.max(HEAD_LENGTH);
        let capacity = config.initial_capacity.clamp(HEAD_LENGTH, max_frame_size);
        Self {
            buffer: vec![0u8; capacity],
            written: 0,
            required: None,
            max_frame_size,
        }
    }

    /// Current buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes received but not yet part of a completed frame.
    pub fn pending(&self) -> &[u8] {
        &self.buffer[..self.written]
    }

    /// Whether unread bytes are buffered.
    pub fn has_pending(&self) -> bool {
        self.written > 0
    }

    /// Remove and return the buffered bytes, resetting the cursors.
    pub fn take_pending(&mut self) -> Vec<u8> {
        let pending = self.buffer[..self.written].to_vec();
        self.written = 0;
        self.required = None;
        pending
    }

    /// Spare buffer space to read into. Never empty.
    pub fn write_slot(&mut self) -> Result<&mut [u8], FrameError> {
        if self.written == self.buffer.len() {
            self.grow()?;
        }
        Ok(&mut self.buffer[self.written..])
    }

    /// Record that `n` bytes were written into [`FrameReassembler::write_slot`]
    /// and return every frame completed as a result, in order.
    pub fn advance(&mut self, n: usize) -> Result<Vec<Datagram>, FrameError> {
        self.written = (self.written + n).min(self.buffer.len());
        let mut frames = Vec::new();

        loop {
            if self.required.is_none() {
                if let Some(body_len) = datagram::body_length(&self.buffer[..self.written]) {
                    let required = body_len + HEAD_LENGTH;
                    if required > self.max_frame_size {
                        return Err(FrameError::FrameTooLarge {
                            size: required,
                            max: self.max_frame_size,
                        });
                    }
                    self.required = Some(required);
                } else {
                    break;
                }
            }

            let Some(required) = self.required else {
                break;
            };

            if self.written >= required {
                frames.push(datagram::decode(&self.buffer[..required])?);
                self.buffer.copy_within(required..self.written, 0);
                self.written -= required;
                self.required = None;
                continue;
            }

            if required > self.buffer.len() {
                self.grow()?;
            }
            break;
        }

        Ok(frames)
    }

    /// Copy `bytes` into the buffer and return every completed frame.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<Datagram>, FrameError> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let slot = self.write_slot()?;
            let n = slot.len().min(bytes.len());
            slot[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            frames.extend(self.advance(n)?);
        }
        Ok(frames)
    }

    fn grow(&mut self) -> Result<(), FrameError> {
        let capacity = self.buffer.len();
        if capacity >= self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: self.required.unwrap_or(capacity + 1),
                max: self.max_frame_size,
            });
        }
        let step = (capacity / 2).clamp(1, MAX_GROWTH_STEP);
        let new_capacity = capacity.saturating_add(step).min(self.max_frame_size);
        tracing::trace!("Growing reassembly buffer from {capacity} to {new_capacity} bytes");
        self.buffer.resize(new_capacity, 0);
        Ok(())
    }
}

/// Read once from `reader` and return the frames completed by that read.
///
/// Returns [`FrameError::ConnectionClosed`] at end of stream; the reassembler
/// keeps any partial frame so the caller can report it.
pub async fn read_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    reassembler: &mut FrameReassembler,
) -> Result<Vec<Datagram>, FrameError> {
    let slot = reassembler.write_slot()?;
    // The slot is never empty, so zero bytes means end of stream.
    let n = reader.read(slot).await?;
    if n == 0 {
        return Err(FrameError::ConnectionClosed);
    }
    reassembler.advance(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::{DatagramType, encode, heartbeat};
    use tokio::io::{AsyncWriteExt, duplex};

    fn frames_bytes(bodies: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for body in bodies {
            out.extend_from_slice(
                encode(body, 1, DatagramType::Application)
                    .unwrap()
                    .as_bytes(),
            );
        }
        out
    }

    #[test]
    fn test_every_chunk_size_yields_frames_in_order() {
        let bodies: Vec<&[u8]> = vec![b"one", b"", b"three three", &[7u8; 40]];
        let stream = frames_bytes(&bodies);

        for chunk in 1..=stream.len() {
            let mut r = FrameReassembler::new(&ReassemblerConfig {
                initial_capacity: 16,
                ..Default::default()
            });
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                got.extend(r.feed(piece).unwrap());
            }
            let got_bodies: Vec<&[u8]> = got.iter().map(|d| d.body()).collect();
            assert_eq!(got_bodies, bodies, "chunk size {chunk}");
            assert!(!r.has_pending());
        }
    }

    #[test]
    fn test_partial_frame_stays_pending() {
        let mut r = FrameReassembler::new(&ReassemblerConfig::default());
        let stream = frames_bytes(&[b"complete", b"partial"]);
        let cut = stream.len() - 3;

        let frames = r.feed(&stream[..cut]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(r.pending().len(), cut - (HEAD_LENGTH + 8));

        let frames = r.feed(&stream[cut..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body(), b"partial");
    }

    #[test]
    fn test_buffer_grows_for_large_frame() {
        let mut r = FrameReassembler::new(&ReassemblerConfig {
            initial_capacity: 32,
            max_frame_size: MAX_FRAME_LENGTH,
        });
        let body = vec![42u8; 10_000];
        let frame = encode(&body, 1, DatagramType::Application).unwrap();

        let frames = r.feed(frame.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body(), &body[..]);
        assert!(r.capacity() >= HEAD_LENGTH + body.len());
    }

    #[test]
    fn test_growth_step_is_bounded() {
        let mut r = FrameReassembler::new(&ReassemblerConfig {
            initial_capacity: 8192,
            max_frame_size: MAX_FRAME_LENGTH,
        });
        let header = encode(&vec![0u8; 20_000], 1, DatagramType::Application).unwrap();
        r.feed(&header.as_bytes()[..HEAD_LENGTH]).unwrap();
        assert_eq!(r.capacity(), 8192 + 2048);
    }

    #[test]
    fn test_oversized_declaration_is_fatal() {
        let mut r = FrameReassembler::new(&ReassemblerConfig {
            initial_capacity: 64,
            max_frame_size: 128,
        });
        let frame = encode(&[0u8; 500], 1, DatagramType::Application).unwrap();
        let err = r.feed(&frame.as_bytes()[..HEAD_LENGTH]).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 516, max: 128 }));
    }

    #[test]
    fn test_take_pending_resets() {
        let mut r = FrameReassembler::new(&ReassemblerConfig::default());
        let frame = heartbeat(1).into_frame();
        r.feed(&frame[..10]).unwrap();
        assert_eq!(r.take_pending(), frame[..10].to_vec());
        assert!(!r.has_pending());
        assert_eq!(r.feed(&frame).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_frames_over_tiny_pipe() {
        let (mut client, mut server) = duplex(8);
        let stream = frames_bytes(&[b"this message is larger than the pipe", b"second"]);

        let writer = tokio::spawn(async move {
            client.write_all(&stream).await.unwrap();
        });

        let mut r = FrameReassembler::new(&ReassemblerConfig::default());
        let mut got = Vec::new();
        while got.len() < 2 {
            got.extend(read_frames(&mut server, &mut r).await.unwrap());
        }
        writer.await.unwrap();

        assert_eq!(got[0].body(), b"this message is larger than the pipe");
        assert_eq!(got[1].body(), b"second");
    }

    #[tokio::test]
    async fn test_read_frames_reports_end_of_stream() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&heartbeat(1).as_bytes()[..5]).await.unwrap();
        drop(client);

        let mut r = FrameReassembler::new(&ReassemblerConfig::default());
        let first = read_frames(&mut server, &mut r).await.unwrap();
        assert!(first.is_empty());
        let end = read_frames(&mut server, &mut r).await;
        assert!(matches!(end, Err(FrameError::ConnectionClosed)));
        assert_eq!(r.pending().len(), 5);
    }
}
