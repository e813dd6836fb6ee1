//! Variable-length integers and position vectors used inside UDP voice payloads.
//!
//! The leading byte carries a unary prefix selecting the payload width:
//!
//! | leading byte | payload                                  |
//! |--------------|------------------------------------------|
//! | `0xxxxxxx`   | 7-bit value                              |
//! | `10xxxxxx`   | 14-bit value, 1 extra byte               |
//! | `110xxxxx`   | 21-bit value, 2 extra bytes              |
//! | `1110xxxx`   | 28-bit value, 3 extra bytes              |
//! | `111100__`   | 32-bit value, 4 extra bytes              |
//! | `111101__`   | 64-bit value, 8 extra bytes              |
//! | `111110__`   | negation (`!`) of the following varint   |
//! | `111111xx`   | `!xx`, i.e. -1 to -4                     |

use crate::transport::errors::TransportError;
use bytes::{Buf, BufMut};
use mumble_protocol_2x::varint::{BufMutExt, ReadExt};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated varint")]
    Truncated,
    #[error("voice codec failed: {0}")]
    Codec(String),
    #[error("empty packet")]
    Empty,
    #[error("unsupported udp message type {0}")]
    UnknownType(u8),
}

impl From<WireError> for TransportError {
    fn from(error: WireError) -> Self {
        TransportError::Protocol(error.to_string())
    }
}

pub fn write_varint<B: BufMut>(dst: &mut B, value: i64) {
    dst.put_varint(value as u64);
}

pub fn read_varint<B: Buf>(src: &mut B) -> Result<i64, WireError> {
    let value = src.reader().read_varint().map_err(|_| WireError::Truncated)?;
    Ok(value as i64)
}

/// Three little-endian `f32`s trailing a voice payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const SIZE: usize = 12;
    pub const OFFSET_X: usize = 0;
    pub const OFFSET_Y: usize = 4;
    pub const OFFSET_Z: usize = 8;

    /// Sentinel for "no position": the first component is `f32::MAX`.
    pub const INVALID: Vec3 = Vec3 {
        x: f32::MAX,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_valid(&self) -> bool {
        self.x != f32::MAX
    }

    pub fn write<B: BufMut>(&self, dst: &mut B) {
        dst.put_f32_le(self.x);
        dst.put_f32_le(self.y);
        dst.put_f32_le(self.z);
    }

    pub fn from_bytes(src: &[u8; Self::SIZE]) -> Self {
        let component = |offset: usize| {
            f32::from_le_bytes([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ])
        };
        Self {
            x: component(Self::OFFSET_X),
            y: component(Self::OFFSET_Y),
            z: component(Self::OFFSET_Z),
        }
    }

    /// Reads a trailing vector when exactly [`Vec3::SIZE`] bytes remain,
    /// otherwise leaves `src` untouched and returns [`Vec3::INVALID`].
    pub fn read_trailing<B: Buf>(src: &mut B) -> Vec3 {
        if src.remaining() != Self::SIZE {
            return Self::INVALID;
        }
        let mut raw = [0u8; Self::SIZE];
        src.copy_to_slice(&mut raw);
        Self::from_bytes(&raw)
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::INVALID
    }
}
