//! Accelerator device model.
//!
//! - [`device`]: device handles and discovery
//! - [`allocator`]: per-device memory accounting
//! - [`memory`]: pinned host buffers and device buffers
//! - [`stream`]: in-order execution streams and events

pub mod allocator;
pub mod device;
pub mod memory;
pub mod stream;
