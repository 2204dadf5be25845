//! kv-tier-attn: Tiered KV store and paged attention.
//!
//! Extends the usable context length beyond accelerator memory by keeping
//! per-layer KV data in pinned host memory and on disk, and streaming it
//! through a double-buffered attention pipeline:
//!   Host RAM (warm) → Local SSD (cool) → NFS/HDD (cold)
//!
//! The accelerator is emulated in host memory; its streams, events and
//! memory limits behave as on a device.

pub mod attention;
pub mod cache;
pub mod config;
pub mod dtype;
pub mod error;
pub mod gpu;
pub mod metrics;
pub mod transfer;
