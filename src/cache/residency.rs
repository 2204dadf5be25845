//! Storage tiers and per-position residency.
//!
//! Every stored position of every layer is in exactly one place: the
//! layer's host window, an extent of a spill file, or nowhere.

use serde::{Deserialize, Serialize};

/// Identifies which storage tier holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 1: pinned host RAM (warm).
    Host,
    /// Tier 2: local SSD (cool).
    LocalDisk,
    /// Tier 3: NFS / remote HDD (cold).
    RemoteDisk,
}

impl Tier {
    /// Returns the numeric tier level (lower = faster). The accelerator,
    /// which this crate does not own, is level 0.
    pub fn level(&self) -> u8 {
        match self {
            Tier::Host => 1,
            Tier::LocalDisk => 2,
            Tier::RemoteDisk => 3,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Host => write!(f, "RAM"),
            Tier::LocalDisk => write!(f, "SSD"),
            Tier::RemoteDisk => write!(f, "NFS"),
        }
    }
}

/// The disk tiers a spill extent can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskTier {
    Local,
    Remote,
}

impl From<DiskTier> for Tier {
    fn from(tier: DiskTier) -> Self {
        match tier {
            DiskTier::Local => Tier::LocalDisk,
            DiskTier::Remote => Tier::RemoteDisk,
        }
    }
}

/// Location of one spilled position inside a layer's spill file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskExtent {
    pub tier: DiskTier,
    /// Byte offset in the layer's spill file on `tier`.
    pub offset: u64,
    /// Stored (possibly compressed) length in bytes.
    pub len: u32,
}

/// Where a position's authoritative bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Residency {
    /// In the layer's host window.
    Host,
    /// In a spill file.
    Disk(DiskExtent),
    /// Never written, or removed.
    #[default]
    Absent,
}

impl Residency {
    pub fn is_host(&self) -> bool {
        matches!(self, Residency::Host)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Residency::Absent)
    }

    pub fn extent(&self) -> Option<DiskExtent> {
        match self {
            Residency::Disk(extent) => Some(*extent),
            _ => None,
        }
    }

    /// The tier holding the data, if any.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Residency::Host => Some(Tier::Host),
            Residency::Disk(extent) => Some(extent.tier.into()),
            Residency::Absent => None,
        }
    }
}
