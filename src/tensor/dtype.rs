//! Element data types

use std::fmt;

use half::{bf16, f16};

/// Element data type of a tensor or memory descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    Bf16,
    /// 32-bit signed container (also used for 8 packed nibbles)
    S32,
    S8,
    U8,
    /// 4-bit signed, sub-byte
    S4,
    /// 4-bit unsigned, sub-byte
    U4,
}

impl DataType {
    /// Element width in bits
    pub fn bits(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 32,
            DataType::F16 | DataType::Bf16 => 16,
            DataType::S8 | DataType::U8 => 8,
            DataType::S4 | DataType::U4 => 4,
        }
    }

    /// Element width in bytes, `None` for sub-byte types
    pub fn size_in_bytes(self) -> Option<usize> {
        if self.is_sub_byte() {
            None
        } else {
            Some(self.bits() / 8)
        }
    }

    pub fn is_sub_byte(self) -> bool {
        self.bits() < 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16 | DataType::Bf16)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    /// Bytes needed to hold `elements` densely packed elements
    pub fn bytes_for(self, elements: usize) -> usize {
        (elements * self.bits()).div_ceil(8)
    }

    /// Decode one byte-addressable element
    ///
    /// `bytes` must start at the element. Sub-byte types decode the low
    /// nibble of the first byte.
    pub fn decode(self, bytes: &[u8]) -> f32 {
        match self {
            DataType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            DataType::F16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
            DataType::Bf16 => bf16::from_le_bytes([bytes[0], bytes[1]]).to_f32(),
            DataType::S32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            DataType::S8 => bytes[0] as i8 as f32,
            DataType::U8 => bytes[0] as f32,
            DataType::U4 => (bytes[0] & 0x0F) as f32,
            DataType::S4 => (((bytes[0] & 0x0F) << 4) as i8 >> 4) as f32,
        }
    }

    /// Encode one byte-addressable element, rounding and saturating integers
    pub fn encode(self, value: f32, out: &mut [u8]) {
        match self {
            DataType::F32 => out[..4].copy_from_slice(&value.to_le_bytes()),
            DataType::F16 => out[..2].copy_from_slice(&f16::from_f32(value).to_le_bytes()),
            DataType::Bf16 => out[..2].copy_from_slice(&bf16::from_f32(value).to_le_bytes()),
            DataType::S32 => out[..4].copy_from_slice(&(value.round() as i32).to_le_bytes()),
            DataType::S8 => out[0] = value.round() as i8 as u8,
            DataType::U8 => out[0] = value.round() as u8,
            DataType::U4 => out[0] = (out[0] & 0xF0) | (value.round().clamp(0.0, 15.0) as u8),
            DataType::S4 => {
                out[0] = (out[0] & 0xF0) | ((value.round().clamp(-8.0, 7.0) as i8 as u8) & 0x0F)
            }
        }
    }

    /// Short lowercase name (`f32`, `bf16`, `u4`, ...)
    pub fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
            DataType::S4 => "s4",
            DataType::U4 => "u4",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
