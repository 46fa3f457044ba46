//! Data types for tensor elements

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of values sharing one exponent in the block-float formats.
pub const BLOCK_FLOAT_GROUP: usize = 16;

/// Element types a device tensor may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// Brain floating point (16-bit)
    BF16,
    /// 8-bit block float: 7-bit mantissa + sign per value, one shared exponent per group
    BFP8,
    /// 4-bit block float: 3-bit mantissa + sign per value, one shared exponent per group
    BFP4,
    /// 32-bit signed integer
    I32,
    /// 32-bit unsigned integer
    U32,
}

impl DType {
    /// Bytes needed to store `numel` elements of this dtype.
    ///
    /// Block-float formats store one exponent byte per
    /// [`BLOCK_FLOAT_GROUP`] values on top of the packed mantissas.
    #[must_use]
    pub const fn bytes_for(self, numel: usize) -> usize {
        let groups = numel.div_ceil(BLOCK_FLOAT_GROUP);
        match self {
            Self::F32 | Self::I32 | Self::U32 => numel * 4,
            Self::BF16 => numel * 2,
            Self::BFP8 => numel + groups,
            Self::BFP4 => numel.div_ceil(2) + groups,
        }
    }

    /// Whether the element type holds floating-point values.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::BF16 | Self::BFP8 | Self::BFP4)
    }

    /// Whether the element type holds integers.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::I32 | Self::U32)
    }

    /// Convert from safetensors dtype string
    #[must_use]
    pub fn from_safetensors(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(Self::F32),
            "BF16" => Some(Self::BF16),
            "I32" => Some(Self::I32),
            "U32" => Some(Self::U32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::BF16 => write!(f, "bf16"),
            Self::BFP8 => write!(f, "bfp8"),
            Self::BFP4 => write!(f, "bfp4"),
            Self::I32 => write!(f, "i32"),
            Self::U32 => write!(f, "u32"),
        }
    }
}
