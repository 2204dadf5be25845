//! Data transfer between tiers.
//!
//! - [`gpu_transfer`]: Host → device chunk copies on a transfer stream
//! - [`disk_io`]: Spill files for host ↔ disk movement

pub mod disk_io;
pub mod gpu_transfer;
