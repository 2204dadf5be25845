//! Accelerator device handles.
//!
//! A [`Device`] bundles the device's description with its memory
//! allocator and hands out device buffers and execution streams. Devices
//! are emulated in host memory: the transfer/compute pipeline, memory
//! limits and stream ordering behave as on real hardware.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gpu::allocator::{AllocatorError, DeviceAllocator};
use crate::gpu::memory::DeviceBuffer;
use crate::gpu::stream::{Stream, StreamError};

/// Information about a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name.
    pub name: String,

    /// Total memory in bytes.
    pub total_memory: u64,

    /// Host↔device bandwidth in bytes/sec (nominal).
    pub transfer_bandwidth: u64,
}

/// Handle to one accelerator device.
#[derive(Debug, Clone)]
pub struct Device {
    info: GpuDeviceInfo,
    allocator: Arc<DeviceAllocator>,
}

impl Device {
    /// An emulated device with `memory_bytes` of device memory.
    pub fn emulated(id: usize, memory_bytes: u64) -> Self {
        let info = GpuDeviceInfo {
            id,
            name: format!("emulated-accelerator-{id}"),
            total_memory: memory_bytes,
            transfer_bandwidth: 12_000_000_000, // ~PCIe 3.0 x16
        };
        info!(
            device = id,
            memory_bytes,
            "Created emulated device"
        );
        Self {
            allocator: DeviceAllocator::new(id, memory_bytes),
            info,
        }
    }

    pub fn id(&self) -> usize {
        self.info.id
    }

    pub fn info(&self) -> &GpuDeviceInfo {
        &self.info
    }

    /// Bytes of device memory not yet allocated.
    pub fn free_memory(&self) -> u64 {
        self.allocator.free_bytes()
    }

    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    /// Allocate a zeroed device buffer.
    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer, AllocatorError> {
        let lease = self.allocator.reserve(len as u64)?;
        Ok(DeviceBuffer::new(self.id(), vec![0u8; len], lease))
    }

    /// Allocate a device buffer and fill it from host bytes.
    pub fn alloc_from(&self, host: &[u8]) -> Result<DeviceBuffer, AllocatorError> {
        let lease = self.allocator.reserve(host.len() as u64)?;
        Ok(DeviceBuffer::new(self.id(), host.to_vec(), lease))
    }

    /// Create a new execution stream on this device.
    pub fn create_stream(&self, purpose: &str) -> Result<Stream, StreamError> {
        Stream::new(format!("dev{}-{purpose}", self.id()))
    }
}

/// Enumerate devices: `count` emulated devices with `memory_bytes` each.
pub fn detect_devices(count: usize, memory_bytes: u64) -> Vec<Device> {
    (0..count)
        .map(|id| Device::emulated(id, memory_bytes))
        .collect()
}
