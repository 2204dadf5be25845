//! Host (pinned) and device buffers.
//!
//! Both are reference-counted byte vectors behind a lock so that stream
//! worker threads can read one while the owner writes another. A
//! [`PinnedSlice`] is a window into a pinned buffer; it keeps the memory
//! alive but does not freeze its contents.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::gpu::allocator::Allocation;

/// Page-locked host memory, directly transferable to a device.
#[derive(Debug, Clone, Default)]
pub struct PinnedBuffer {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl PinnedBuffer {
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether another handle (e.g. an outstanding view) references this buffer.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    /// A view of `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> PinnedSlice {
        PinnedSlice {
            buf: self.clone(),
            offset,
            len,
        }
    }

    /// A view of the whole buffer.
    pub fn whole(&self) -> PinnedSlice {
        let len = self.len();
        self.slice(0, len)
    }
}

/// A byte window into a [`PinnedBuffer`].
#[derive(Debug, Clone, Default)]
pub struct PinnedSlice {
    buf: PinnedBuffer,
    offset: usize,
    len: usize,
}

impl PinnedSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` over the viewed bytes under the buffer's read lock.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.buf.read();
        f(&data[self.offset..self.offset + self.len])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|bytes| bytes.to_vec())
    }

    /// Copy `dst.len()` bytes starting `at` bytes into the view.
    pub fn copy_to(&self, at: usize, dst: &mut [u8]) {
        self.with(|bytes| dst.copy_from_slice(&bytes[at..at + dst.len()]));
    }
}

/// Memory on an accelerator device.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    device_id: usize,
    data: Arc<RwLock<Vec<u8>>>,
    _lease: Arc<Allocation>,
}

impl DeviceBuffer {
    pub(crate) fn new(device_id: usize, data: Vec<u8>, lease: Allocation) -> Self {
        Self {
            device_id,
            data: Arc::new(RwLock::new(data)),
            _lease: Arc::new(lease),
        }
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous device→host copy.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_views_live_data() {
        let buf = PinnedBuffer::from_vec((0u8..16).collect());
        let view = buf.slice(4, 4);
        assert_eq!(view.to_vec(), vec![4, 5, 6, 7]);

        buf.write()[5] = 99;
        assert_eq!(view.to_vec(), vec![4, 99, 6, 7]);
    }

    #[test]
    fn test_shared_tracking() {
        let buf = PinnedBuffer::new(8);
        assert!(!buf.is_shared());
        let view = buf.whole();
        assert!(buf.is_shared());
        drop(view);
        assert!(!buf.is_shared());
    }

    #[test]
    fn test_copy_to() {
        let buf = PinnedBuffer::from_vec((0u8..16).collect());
        let view = buf.slice(8, 8);
        let mut dst = [0u8; 3];
        view.copy_to(2, &mut dst);
        assert_eq!(dst, [10, 11, 12]);
    }
}
