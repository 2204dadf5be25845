//! Tiered KV store.
//!
//! This module contains the store's data structures and algorithms:
//! - [`residency`]: Tier definitions and per-position residency
//! - [`layer`]: One layer's host window, growth, spill and page-in
//! - [`pager`]: The public store, budget ledger and locking
//! - [`evictor`]: Oldest-first victim selection and window planning
//! - [`compressor`]: zstd compression of spilled rows

pub mod compressor;
pub mod evictor;
pub(crate) mod layer;
pub mod pager;
pub mod residency;
