//! Device memory accounting for chunk buffers.
//!
//! Each device gets a fixed byte capacity. Allocations reserve bytes
//! against it and give them back when the last handle to the buffer drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorClass;

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Out of device memory on device {device_id}: need {needed} bytes, {free} free")]
    OutOfMemory {
        device_id: usize,
        needed: u64,
        free: u64,
    },

    #[error("Zero-sized allocation on device {0}")]
    ZeroSized(usize),
}

impl AllocatorError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Device
    }
}

/// Per-device allocator.
#[derive(Debug)]
pub struct DeviceAllocator {
    /// Device ID.
    device_id: usize,

    /// Total bytes available.
    capacity: u64,

    /// Bytes currently reserved.
    used: AtomicU64,
}

impl DeviceAllocator {
    pub fn new(device_id: usize, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            capacity,
            used: AtomicU64::new(0),
        })
    }

    /// Reserve `bytes`, returning a lease that releases them on drop.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> Result<Allocation, AllocatorError> {
        if bytes == 0 {
            return Err(AllocatorError::ZeroSized(self.device_id));
        }
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let free = self.capacity.saturating_sub(used);
            if bytes > free {
                return Err(AllocatorError::OutOfMemory {
                    device_id: self.device_id,
                    needed: bytes,
                    free,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        debug!(device = self.device_id, bytes, "Reserved device memory");
        Ok(Allocation {
            allocator: Arc::clone(self),
            bytes,
        })
    }

    /// Bytes not yet reserved.
    pub fn free_bytes(&self) -> u64 {
        self.capacity
            .saturating_sub(self.used.load(Ordering::Acquire))
    }
}

/// A reservation of device memory.
#[derive(Debug)]
pub struct Allocation {
    allocator: Arc<DeviceAllocator>,
    bytes: u64,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.allocator.used.fetch_sub(self.bytes, Ordering::AcqRel);
        debug!(
            device = self.allocator.device_id,
            bytes = self.bytes,
            "Released device memory"
        );
    }
}
