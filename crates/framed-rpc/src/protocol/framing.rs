//! Length-prefixed framing for the wire protocol.
//!
//! Every frame is `<length><body>` where the length is a CBOR unsigned
//! integer in its shortest encoding and the body is `length` bytes of CBOR.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// CBOR major type of unsigned integers.
const MAJOR_UNSIGNED: u8 = 0;

/// Codec for encoding/decoding length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The largest body this codec accepts.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a CBOR unsigned integer header at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the header
/// length and the decoded value.
fn parse_length_prefix(buf: &[u8]) -> Result<Option<(usize, u64)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let major = first >> 5;
    if major != MAJOR_UNSIGNED {
        return Err(Error::Framing(format!(
            "length prefix must be an unsigned integer, got major type {major}"
        )));
    }

    let info = first & 0x1f;
    let width = match info {
        0..=23 => return Ok(Some((1, u64::from(info)))),
        24 => 1,
        25 => 2,
        26 => 4,
        27 => 8,
        _ => {
            return Err(Error::Framing(format!(
                "invalid length prefix additional info {info}"
            )));
        }
    };

    if buf.len() < 1 + width {
        return Ok(None);
    }

    let mut raw = &buf[1..=width];
    let value = match width {
        1 => u64::from(raw.get_u8()),
        2 => u64::from(raw.get_u16()),
        4 => u64::from(raw.get_u32()),
        _ => raw.get_u64(),
    };
    Ok(Some((1 + width, value)))
}

/// Writes `len` as a minimally encoded CBOR unsigned integer.
#[allow(clippy::cast_possible_truncation)]
fn put_length_prefix(len: u64, dst: &mut BytesMut) {
    if len < 24 {
        dst.put_u8(len as u8);
    } else if len <= u64::from(u8::MAX) {
        dst.put_u8(24);
        dst.put_u8(len as u8);
    } else if len <= u64::from(u16::MAX) {
        dst.put_u8(25);
        dst.put_u16(len as u16);
    } else if len <= u64::from(u32::MAX) {
        dst.put_u8(26);
        dst.put_u32(len as u32);
    } else {
        dst.put_u8(27);
        dst.put_u64(len);
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some((header_len, body_len)) = parse_length_prefix(buf)? else {
            return Ok(None);
        };

        let body_len = usize::try_from(body_len)
            .ok()
            .filter(|len| *len <= self.max_frame_size)
            .ok_or_else(|| {
                Error::Framing(format!(
                    "frame size {body_len} exceeds maximum {}",
                    self.max_frame_size
                ))
            })?;

        let frame_len = header_len + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(header_len);
        Ok(Some(buf.split_to(body_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<()> {
        if body.len() > self.max_frame_size {
            return Err(Error::Framing(format!(
                "frame size {} exceeds maximum {}",
                body.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(9 + body.len());
        put_length_prefix(body.len() as u64, dst);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
