//! Host → device transfer engine.
//!
//! Chunk copies are enqueued on a transfer stream so they overlap with
//! compute on another stream. The copy itself runs on the stream's worker;
//! the engine only validates.

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorClass;
use crate::gpu::memory::{DeviceBuffer, PinnedSlice};
use crate::gpu::stream::{Stream, StreamError};

#[derive(Error, Debug)]
pub enum GpuTransferError {
    #[error("Buffer on device {got} used with engine for device {expected}")]
    DeviceMismatch { expected: usize, got: usize },

    #[error("Transfer buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Source range {offset}+{len} exceeds host buffer of {available} bytes")]
    SourceOutOfRange {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl GpuTransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GpuTransferError::SourceOutOfRange { .. } => ErrorClass::Addressing,
            _ => ErrorClass::Device,
        }
    }
}

/// One chunk copy: the same byte range of the host K and V sources into a
/// device slot.
#[derive(Debug, Clone)]
pub struct ChunkCopy {
    pub k_src: PinnedSlice,
    pub v_src: PinnedSlice,
    /// Byte offset into both sources.
    pub offset: usize,
    /// Bytes to copy from each source.
    pub len: usize,
    pub k_dst: DeviceBuffer,
    pub v_dst: DeviceBuffer,
}

/// Transfer engine for one device.
#[derive(Debug)]
pub struct GpuTransferEngine {
    device_id: usize,
}

impl GpuTransferEngine {
    pub fn new(device_id: usize) -> Self {
        Self { device_id }
    }

    fn check_device(&self, buf: &DeviceBuffer) -> Result<(), GpuTransferError> {
        if buf.device_id() != self.device_id {
            return Err(GpuTransferError::DeviceMismatch {
                expected: self.device_id,
                got: buf.device_id(),
            });
        }
        Ok(())
    }

    /// Enqueue a host→device chunk copy on `stream`. Returns once queued.
    pub fn copy_to_device_async(
        &self,
        stream: &Stream,
        copy: ChunkCopy,
    ) -> Result<(), GpuTransferError> {
        self.check_device(&copy.k_dst)?;
        self.check_device(&copy.v_dst)?;

        for src in [&copy.k_src, &copy.v_src] {
            if copy.offset + copy.len > src.len() {
                return Err(GpuTransferError::SourceOutOfRange {
                    offset: copy.offset,
                    len: copy.len,
                    available: src.len(),
                });
            }
        }
        let available = copy.k_dst.len().min(copy.v_dst.len());
        if copy.len > available {
            return Err(GpuTransferError::BufferTooSmall {
                needed: copy.len,
                available,
            });
        }

        debug!(
            device = self.device_id,
            stream = stream.name(),
            offset = copy.offset,
            size = copy.len,
            "H2D transfer"
        );
        stream.enqueue(move || {
            let ChunkCopy {
                k_src,
                v_src,
                offset,
                len,
                k_dst,
                v_dst,
            } = copy;
            k_src.copy_to(offset, &mut k_dst.write()[..len]);
            v_src.copy_to(offset, &mut v_dst.write()[..len]);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::Device;
    use crate::gpu::memory::PinnedBuffer;

    fn copy_for(device: &Device, offset: usize, len: usize) -> ChunkCopy {
        let k = PinnedBuffer::from_vec((0u8..64).collect());
        let v = PinnedBuffer::from_vec((64u8..128).collect());
        ChunkCopy {
            k_src: k.whole(),
            v_src: v.whole(),
            offset,
            len,
            k_dst: device.alloc(16).unwrap(),
            v_dst: device.alloc(16).unwrap(),
        }
    }

    #[test]
    fn test_h2d_transfer() {
        let device = Device::emulated(0, 1024);
        let stream = device.create_stream("transfer").unwrap();
        let engine = GpuTransferEngine::new(0);

        let copy = copy_for(&device, 8, 16);
        let (k_dst, v_dst) = (copy.k_dst.clone(), copy.v_dst.clone());
        engine.copy_to_device_async(&stream, copy).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(k_dst.to_vec(), (8u8..24).collect::<Vec<_>>());
        assert_eq!(v_dst.to_vec(), (72u8..88).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejects_bad_copies() {
        let device = Device::emulated(0, 1024);
        let stream = device.create_stream("transfer").unwrap();
        let engine = GpuTransferEngine::new(0);

        let result = engine.copy_to_device_async(&stream, copy_for(&device, 60, 16));
        assert!(matches!(result, Err(GpuTransferError::SourceOutOfRange { .. })));

        let result = engine.copy_to_device_async(&stream, copy_for(&device, 0, 32));
        assert!(matches!(result, Err(GpuTransferError::BufferTooSmall { .. })));

        let other = Device::emulated(3, 1024);
        let result = engine.copy_to_device_async(&stream, copy_for(&other, 0, 8));
        assert!(matches!(result, Err(GpuTransferError::DeviceMismatch { expected: 0, got: 3 })));
        stream.synchronize().unwrap();
    }
}
