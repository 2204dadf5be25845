//! Compression of spilled rows.
//!
//! A spilled position is stored as one extent: the K row followed by the V
//! row, zstd-compressed as an independent frame so it can be read back
//! without touching its neighbours.

use crate::config::CompressionConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Extent decoded to {got} bytes, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },
}

/// The compression engine for spill extents.
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Pack one position's K and V rows into an extent payload.
    pub fn pack(&self, k_row: &[u8], v_row: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut raw = Vec::with_capacity(k_row.len() + v_row.len());
        raw.extend_from_slice(k_row);
        raw.extend_from_slice(v_row);
        if self.config.enabled {
            self.zstd_compress(&raw)
        } else {
            Ok(raw)
        }
    }

    /// Reverse [`pack`](Self::pack) into `k_out` and `v_out`.
    pub fn unpack(
        &self,
        payload: &[u8],
        k_out: &mut [u8],
        v_out: &mut [u8],
    ) -> Result<(), CompressionError> {
        let expected = k_out.len() + v_out.len();
        let decoded;
        let raw: &[u8] = if self.config.enabled {
            decoded = self.zstd_decompress(payload)?;
            &decoded
        } else {
            payload
        };
        if raw.len() != expected {
            return Err(CompressionError::SizeMismatch {
                expected,
                got: raw.len(),
            });
        }
        let (k, v) = raw.split_at(k_out.len());
        k_out.copy_from_slice(k);
        v_out.copy_from_slice(v);
        Ok(())
    }

    /// Compress data with zstd.
    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    /// Decompress zstd data.
    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let compressor = Compressor::new(CompressionConfig::default());
        let data = vec![42u8; 4096];

        let compressed = compressor.zstd_compress(&data).unwrap();
        assert!(compressed.len() < data.len()); // should compress well

        let decompressed = compressor.zstd_decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_pack_unpack_splits_rows() {
        let compressor = Compressor::new(CompressionConfig::default());
        let k: Vec<u8> = (0..64).collect();
        let v: Vec<u8> = (64..128).collect();

        let payload = compressor.pack(&k, &v).unwrap();
        let (mut k_out, mut v_out) = (vec![0u8; 64], vec![0u8; 64]);
        compressor.unpack(&payload, &mut k_out, &mut v_out).unwrap();
        assert_eq!(k_out, k);
        assert_eq!(v_out, v);
    }

    #[test]
    fn test_uncompressed_passthrough() {
        let compressor = Compressor::new(CompressionConfig {
            enabled: false,
            zstd_level: 3,
        });
        let payload = compressor.pack(&[1, 2], &[3, 4]).unwrap();
        assert_eq!(payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_size_mismatch_detected() {
        let compressor = Compressor::new(CompressionConfig::default());
        let payload = compressor.pack(&[1, 2], &[3, 4]).unwrap();
        let (mut k, mut v) = (vec![0u8; 4], vec![0u8; 4]);
        assert!(matches!(
            compressor.unpack(&payload, &mut k, &mut v),
            Err(CompressionError::SizeMismatch { expected: 8, got: 4 })
        ));
    }
}
