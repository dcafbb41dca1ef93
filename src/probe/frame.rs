//! Probe frame codec.
//!
//! ```text
//! offset  0      1               17              33            64
//!         +------+---------------+---------------+-------------+
//!         | 'S'  | secs (16B LE) | nanos (16B LE)|  zero pad   |
//!         +------+---------------+---------------+-------------+
//! ```
//!
//! Timestamps are `u64` but each field is 16 bytes wide. Encoding widens the
//! value, so the upper 8 bytes of a field are always zero. Decoding reads the
//! full 16 bytes and keeps only the low 64 bits; anything a peer puts in the
//! upper bytes is silently dropped.

use crate::clock::Timestamp;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Total width of every frame on the wire.
pub const FRAME_SIZE: usize = 64;

/// Tag byte at offset 0 of every frame.
pub const MARKER: u8 = b'S';

/// Width of each timestamp field.
pub const FIELD_WIDTH: usize = 16;

const PADDING: usize = FRAME_SIZE - 1 - 2 * FIELD_WIDTH;

/// Frame decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than `FRAME_SIZE` bytes were supplied.
    Short(usize),
    /// Byte 0 is not the marker.
    BadMarker(u8),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Short(len) => {
                write!(f, "frame too short: {len} < {FRAME_SIZE} bytes")
            }
            FrameError::BadMarker(byte) => write!(f, "bad frame marker 0x{byte:02x}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Build the wire frame for a send timestamp.
pub fn encode(now: Timestamp) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_SIZE);
    frame.put_u8(MARKER);
    frame.put_u128_le(u128::from(now.secs));
    frame.put_u128_le(u128::from(now.nanos));
    frame.put_bytes(0, PADDING);
    frame.freeze()
}

/// Decode the timestamp carried by the first `FRAME_SIZE` bytes of `input`.
pub fn decode(input: &[u8]) -> Result<Timestamp, FrameError> {
    if input.len() < FRAME_SIZE {
        return Err(FrameError::Short(input.len()));
    }

    let mut buf = &input[..FRAME_SIZE];
    let marker = buf.get_u8();
    if marker != MARKER {
        return Err(FrameError::BadMarker(marker));
    }

    let secs = narrow(buf.get_u128_le());
    let nanos = narrow(buf.get_u128_le());
    Ok(Timestamp::new(secs, nanos))
}

/// Keep the low 64 bits of a field.
#[inline]
fn narrow(field: u128) -> u64 {
    field as u64
}
