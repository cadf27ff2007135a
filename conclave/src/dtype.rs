//! Data types for dispatch payload tensors

use std::fmt;

/// Element types that appear in MoE dispatch wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 8-bit signed integer (quantized activations)
    I8,
    /// 8-bit unsigned integer (masks)
    U8,
    /// 32-bit unsigned integer (ids, indices)
    U32,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::U32 => 4,
            Self::I8 | Self::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::I8 => write!(f, "i8"),
            Self::U8 => write!(f, "u8"),
            Self::U32 => write!(f, "u32"),
        }
    }
}

/// Trait for types that can be used as tensor elements
pub trait TensorDType: Copy + Clone + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl TensorDType for i8 {
    const DTYPE: DType = DType::I8;
}

impl TensorDType for u8 {
    const DTYPE: DType = DType::U8;
}

impl TensorDType for u32 {
    const DTYPE: DType = DType::U32;
}
