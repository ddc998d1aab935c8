//! Element types understood by eager kernels, compiled computations and the C ABI.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical element type of a tensor or tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE-754 float.
    #[serde(rename = "float")]
    F32,
    /// 64-bit IEEE-754 float.
    #[serde(rename = "double")]
    F64,
    /// 32-bit signed integer.
    #[serde(rename = "int32")]
    I32,
    /// 64-bit signed integer.
    #[serde(rename = "int64")]
    I64,
    /// One byte per element, zero is false.
    #[serde(rename = "bool")]
    Bool,
    /// Handle to a runtime resource such as a variable; carries no dense payload.
    #[serde(rename = "resource")]
    Resource,
}

impl DType {
    /// Bytes per scalar element. Resource handles have no dense representation.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
            DType::Resource => 0,
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// Stable numeric tag used across the C ABI.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 1,
            DType::F64 => 2,
            DType::I32 => 3,
            DType::I64 => 9,
            DType::Bool => 10,
            DType::Resource => 20,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(DType::F32),
            2 => Some(DType::F64),
            3 => Some(DType::I32),
            9 => Some(DType::I64),
            10 => Some(DType::Bool),
            20 => Some(DType::Resource),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F64 => "double",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::Bool => "bool",
            DType::Resource => "resource",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
