//! Element types for K/V storage and attention I/O.
//!
//! Rows are stored little-endian and may sit at any byte offset inside a
//! host or device buffer, so elements are decoded byte-wise rather than by
//! casting the buffer.

use half::f16;
use serde::{Deserialize, Serialize};

/// Storage dtype of K, V, Q and the attention output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    F32,
}

impl DType {
    /// Bytes per element.
    pub fn size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }

    /// Map a store element width to its dtype.
    pub fn from_elem_bytes(elem_bytes: usize) -> Option<DType> {
        match elem_bytes {
            2 => Some(DType::F16),
            4 => Some(DType::F32),
            _ => None,
        }
    }

    /// Read element `idx` of `bytes` widened to f64.
    #[inline]
    pub fn load(&self, bytes: &[u8], idx: usize) -> f64 {
        match self {
            DType::F16 => {
                let o = idx * 2;
                f16::from_le_bytes([bytes[o], bytes[o + 1]]).to_f64()
            }
            DType::F32 => {
                let o = idx * 4;
                f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]) as f64
            }
        }
    }

    /// Write `value` narrowed to this dtype at element `idx` of `bytes`.
    #[inline]
    pub fn store(&self, bytes: &mut [u8], idx: usize, value: f64) {
        match self {
            DType::F16 => {
                let o = idx * 2;
                bytes[o..o + 2].copy_from_slice(&f16::from_f64(value).to_le_bytes());
            }
            DType::F32 => {
                let o = idx * 4;
                bytes[o..o + 4].copy_from_slice(&(value as f32).to_le_bytes());
            }
        }
    }

    /// Encode a slice of f32 values into this dtype's byte representation.
    pub fn encode(&self, values: &[f32]) -> Vec<u8> {
        match self {
            DType::F32 => bytemuck::cast_slice(values).to_vec(),
            DType::F16 => {
                let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
        }
    }

    /// Decode a byte buffer in this dtype into f32 values.
    pub fn decode(&self, bytes: &[u8]) -> Vec<f32> {
        (0..bytes.len() / self.size())
            .map(|i| self.load(bytes, i) as f32)
            .collect()
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
        }
    }
}
