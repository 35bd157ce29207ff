//! Length-prefixed wire codec.
//!
//! Every message exchanged with an agent is one frame:
//!
//! ```text
//! +--------------------+-----------------------------+
//! | payload_len (u32)  | payload (payload_len bytes) |
//! | big-endian         | opaque                      |
//! +--------------------+-----------------------------+
//!       4 bytes                 variable
//! ```
//!
//! The decoder is incremental: it is fed whatever a read returned (nothing,
//! part of a frame, or several frames) and yields complete payloads only.
//! A malformed length desynchronises the stream for good, so decode errors
//! are fatal for the connection.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use agent_relay_core::config::DEFAULT_MAX_FRAME_LEN;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Frame decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("Stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Frame encode error.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Codec for `[u32 BE length][payload]` frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Create a codec that rejects payloads above `max_frame_len`.
    ///
    /// The limit is clamped to what a `u32` prefix can describe.
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        let wire_max = usize::try_from(u32::MAX).unwrap_or(usize::MAX);
        Self {
            max_frame_len: max_frame_len.min(wire_max),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, DecodeError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&src[..LEN_PREFIX]);
        let len = usize::try_from(u32::from_be_bytes(prefix)).unwrap_or(usize::MAX);

        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = LEN_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, DecodeError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(DecodeError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_frame(&payload, self.max_frame_len, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_frame(payload, self.max_frame_len, dst)
    }
}

fn put_frame(payload: &[u8], max: usize, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= max)
        .ok_or(EncodeError::PayloadTooLarge {
            len: payload.len(),
            max,
        })?;

    dst.reserve(LEN_PREFIX + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Frame `payload` without a codec instance.
///
/// Only the wire limit (`u32::MAX`) applies.
///
/// # Errors
/// Returns error if the payload does not fit a `u32` length prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, EncodeError> {
    let mut dst = BytesMut::new();
    put_frame(payload, usize::MAX, &mut dst)?;
    Ok(dst.freeze())
}
