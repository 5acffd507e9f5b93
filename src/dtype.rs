//! Scalar-type tags used as half of every kernel key.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
}

impl DType {
    /// Type token used in device function names (`add_float`, `relu_half`).
    pub fn token(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::UInt8 => "uchar",
            DType::UInt16 => "ushort",
            DType::UInt32 => "uint",
            DType::UInt64 => "ulong",
            DType::Int8 => "char",
            DType::Int16 => "short",
            DType::Int32 => "int",
            DType::Int64 => "long",
            DType::Float16 => "half",
            DType::Float32 => "float",
            DType::Float64 => "double",
        }
    }

    /// Element size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 | DType::Float16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Float64 => 8,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::Bool => "Bool",
            DType::UInt8 => "UInt8",
            DType::UInt16 => "UInt16",
            DType::UInt32 => "UInt32",
            DType::UInt64 => "UInt64",
            DType::Int8 => "Int8",
            DType::Int16 => "Int16",
            DType::Int32 => "Int32",
            DType::Int64 => "Int64",
            DType::Float16 => "Float16",
            DType::Float32 => "Float32",
            DType::Float64 => "Float64",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_and_sizes() {
        assert_eq!(DType::Float32.token(), "float");
        assert_eq!(DType::Float16.token(), "half");
        assert_eq!(DType::Float16.size_in_bytes(), 2);
        assert_eq!(DType::Int64.size_in_bytes(), 8);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DType::Float32).unwrap();
        assert_eq!(json, "\"float32\"");
        let back: DType = serde_json::from_str("\"uint16\"").unwrap();
        assert_eq!(back, DType::UInt16);
    }
}
