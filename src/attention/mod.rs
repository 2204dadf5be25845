//! Paged attention over host-resident KV.
//!
//! - [`kernel`]: Online-softmax chunk math and GQA head mapping
//! - [`context`]: Ping-pong device buffers and the double-buffered forward pass
//! - [`bridge`]: Explicit runtime and the status-code entry point

pub mod bridge;
pub mod context;
pub mod kernel;
