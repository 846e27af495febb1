//! Framing for the stdio transport.
//!
//! A frame on the wire:
//!
//! ```text
//! 0x41 0x41 0x41 0x41 | length (u32, big-endian) | payload (MessagePack)
//! ```
//!
//! The decoder scans for four consecutive marker bytes, so garbage written
//! to stdout by a module (stray prints, partial writes) is skipped until the
//! next marker run. A length above the configured maximum is treated as a
//! desynchronized stream and the decoder falls back to scanning.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::FrameError;

/// Resynchronization marker byte.
pub const FRAME_MARKER: u8 = 0x41;

/// Number of consecutive markers that open a frame.
pub const MARKER_RUN: usize = 4;

/// Largest payload accepted by default (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LENGTH_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Scanning { seen: usize },
    Length,
    Payload { len: usize },
}

/// Codec turning a byte stream into payload frames and back.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
    max_len: usize,
    resyncs: u64,
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    /// Create a codec accepting payloads up to `max_len` bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: DecodeState::Scanning { seen: 0 },
            max_len,
            resyncs: 0,
        }
    }

    /// Number of frames dropped because of a malformed length.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Serialize an envelope into a frame payload.
    pub fn encode_payload(envelope: &Envelope) -> Result<Bytes, FrameError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?))
    }

    /// Deserialize a frame payload into an envelope.
    pub fn decode_payload(payload: &[u8]) -> Result<Envelope, FrameError> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                DecodeState::Scanning { mut seen } => {
                    let mut consumed = 0;
                    for &byte in src.iter() {
                        consumed += 1;
                        if byte == FRAME_MARKER {
                            seen += 1;
                            if seen == MARKER_RUN {
                                break;
                            }
                        } else {
                            seen = 0;
                        }
                    }
                    src.advance(consumed);

                    if seen == MARKER_RUN {
                        self.state = DecodeState::Length;
                    } else {
                        self.state = DecodeState::Scanning { seen };
                        return Ok(None);
                    }
                }
                DecodeState::Length => {
                    if src.len() < LENGTH_LEN {
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    if len > self.max_len {
                        self.resyncs += 1;
                        self.state = DecodeState::Scanning { seen: 0 };
                        continue;
                    }
                    self.state = DecodeState::Payload { len };
                }
                DecodeState::Payload { len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    self.state = DecodeState::Scanning { seen: 0 };
                    return Ok(Some(payload));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        // A truncated trailing frame is discarded rather than reported.
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_len || payload.len() > u32::MAX as usize {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_len,
            });
        }
        dst.reserve(MARKER_RUN + LENGTH_LEN + payload.len());
        dst.put_bytes(FRAME_MARKER, MARKER_RUN);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
#[path = "framing_tests.rs"]
mod tests;
