//! Spill-file I/O for evicted KV positions.
//!
//! Each layer gets one file per disk tier
//! (`<dir>/layer_NNN.kvspill`). A spilled position is one extent in that
//! file, addressed by (offset, len), so single positions are read back
//! with a seek instead of decompressing the whole file.
//!
//! Budgets count live extents. A released extent becomes a hole that later
//! extents of the same layer reuse (first fit), so a file only grows past
//! its holes when no hole is large enough. [`SpillStore::truncate_all`]
//! empties every file.
//!
//! When both tiers are configured, the oldest local extents can be demoted
//! to the remote tier to keep room for new spills on the local one.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::residency::{DiskExtent, DiskTier};

#[derive(Error, Debug)]
pub enum DiskIoError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No disk tier can hold a {needed}-byte extent")]
    BudgetExhausted { needed: u64 },

    #[error("Storage path not configured for tier {0:?}")]
    PathNotConfigured(DiskTier),

    #[error("Extent of {0} bytes exceeds the extent size limit")]
    ExtentTooLarge(usize),
}

#[derive(Debug, Default, Clone)]
pub struct DiskIoStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

/// One disk tier: a directory, a byte budget and the open layer files.
#[derive(Debug)]
struct SpillTier {
    tier: DiskTier,
    dir: PathBuf,
    budget: u64,
    used: u64,
    files: HashMap<usize, SpillFile>,
}

#[derive(Debug)]
struct SpillFile {
    file: File,
    len: u64,
    /// Released (offset, len) ranges available for reuse.
    holes: Vec<(u64, u32)>,
}

impl SpillFile {
    /// Offset for a new `len`-byte extent: the first hole that fits, else
    /// the end of the file.
    fn place(&mut self, len: u32) -> u64 {
        if let Some(i) = self.holes.iter().position(|&(_, hole)| hole >= len) {
            let (offset, hole) = self.holes[i];
            if hole == len {
                self.holes.swap_remove(i);
            } else {
                self.holes[i] = (offset + len as u64, hole - len);
            }
            return offset;
        }
        let offset = self.len;
        self.len += len as u64;
        offset
    }
}

impl SpillTier {
    fn file_path(dir: &Path, layer: usize) -> PathBuf {
        dir.join(format!("layer_{layer:03}.kvspill"))
    }

    fn file(&mut self, layer: usize) -> Result<&mut SpillFile, DiskIoError> {
        if !self.files.contains_key(&layer) {
            let path = Self::file_path(&self.dir, layer);
            // Stale data from a previous run is never addressed; start empty.
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            debug!(layer, path = %path.display(), "Opened spill file");
            self.files.insert(
                layer,
                SpillFile {
                    file,
                    len: 0,
                    holes: Vec::new(),
                },
            );
        }
        self.files
            .get_mut(&layer)
            .ok_or(DiskIoError::PathNotConfigured(self.tier))
    }

    fn has_room(&self, bytes: u64) -> bool {
        self.used + bytes <= self.budget
    }
}

/// Disk I/O engine for spilling and loading positions.
#[derive(Debug)]
pub struct SpillStore {
    /// Local tier first, remote tier as overflow.
    tiers: Vec<SpillTier>,

    /// Transfer statistics.
    stats: DiskIoStats,
}

impl SpillStore {
    /// Create a spill store, making sure the configured directories exist.
    pub fn new(
        local: Option<(PathBuf, u64)>,
        remote: Option<(PathBuf, u64)>,
    ) -> Result<Self, std::io::Error> {
        let mut tiers = Vec::new();
        for (tier, cfg) in [(DiskTier::Local, local), (DiskTier::Remote, remote)] {
            if let Some((dir, budget)) = cfg {
                fs::create_dir_all(&dir)?;
                info!(tier = ?tier, dir = %dir.display(), budget, "Spill tier ready");
                tiers.push(SpillTier {
                    tier,
                    dir,
                    budget,
                    used: 0,
                    files: HashMap::new(),
                });
            }
        }
        Ok(Self {
            tiers,
            stats: DiskIoStats::default(),
        })
    }

    /// Whether any disk tier is configured.
    pub fn is_enabled(&self) -> bool {
        !self.tiers.is_empty()
    }

    fn tier_mut(&mut self, tier: DiskTier) -> Result<&mut SpillTier, DiskIoError> {
        self.tiers
            .iter_mut()
            .find(|t| t.tier == tier)
            .ok_or(DiskIoError::PathNotConfigured(tier))
    }

    /// Append one extent for `layer`, on the first tier with room.
    pub fn append(&mut self, layer: usize, data: &[u8]) -> Result<DiskExtent, DiskIoError> {
        let needed = data.len() as u64;
        let idx = self
            .tiers
            .iter()
            .position(|t| t.has_room(needed))
            .ok_or_else(|| {
                warn!(layer, needed, "Disk tiers exhausted");
                DiskIoError::BudgetExhausted { needed }
            })?;
        self.write_to(idx, layer, data)
    }

    fn write_to(&mut self, idx: usize, layer: usize, data: &[u8]) -> Result<DiskExtent, DiskIoError> {
        let len = u32::try_from(data.len()).map_err(|_| DiskIoError::ExtentTooLarge(data.len()))?;
        let needed = data.len() as u64;
        let tier = &mut self.tiers[idx];
        let tier_id = tier.tier;
        let spill = tier.file(layer)?;
        let offset = spill.place(len);
        spill.file.seek(SeekFrom::Start(offset))?;
        spill.file.write_all(data)?;
        tier.used += needed;

        debug!(layer, tier = ?tier_id, offset, len, "Wrote extent");

        self.stats.total_writes += 1;
        self.stats.total_bytes_written += needed;

        Ok(DiskExtent {
            tier: tier_id,
            offset,
            len,
        })
    }

    /// Bytes that must leave the local tier before it can take `needed`
    /// more. Zero when it already has room, when there is no remote tier
    /// to demote to, or when `needed` exceeds the whole local budget.
    pub fn local_deficit(&self, needed: u64) -> u64 {
        let local = self.tiers.iter().find(|t| t.tier == DiskTier::Local);
        let has_remote = self.tiers.iter().any(|t| t.tier == DiskTier::Remote);
        match local {
            Some(t) if has_remote && needed <= t.budget => {
                (t.used + needed).saturating_sub(t.budget)
            }
            _ => 0,
        }
    }

    /// Move a local extent of `layer` to the remote tier. Returns the new
    /// extent; the local one is released.
    pub fn demote(&mut self, layer: usize, extent: &DiskExtent) -> Result<DiskExtent, DiskIoError> {
        let needed = extent.len as u64;
        let idx = self
            .tiers
            .iter()
            .position(|t| t.tier == DiskTier::Remote && t.has_room(needed))
            .ok_or(DiskIoError::BudgetExhausted { needed })?;
        let data = self.read(layer, extent)?;
        let moved = self.write_to(idx, layer, &data)?;
        self.release(layer, extent);
        Ok(moved)
    }

    /// Read one extent of `layer`.
    pub fn read(&mut self, layer: usize, extent: &DiskExtent) -> Result<Vec<u8>, DiskIoError> {
        let tier = self.tier_mut(extent.tier)?;
        let spill = tier.file(layer)?;
        let mut data = vec![0u8; extent.len as usize];
        spill.file.seek(SeekFrom::Start(extent.offset))?;
        spill.file.read_exact(&mut data)?;

        debug!(layer, tier = ?extent.tier, offset = extent.offset, len = extent.len, "Read extent");

        self.stats.total_reads += 1;
        self.stats.total_bytes_read += data.len() as u64;

        Ok(data)
    }

    /// Release an extent of `layer`: its bytes leave the tier's budget and
    /// its range becomes reusable.
    pub fn release(&mut self, layer: usize, extent: &DiskExtent) {
        if let Ok(tier) = self.tier_mut(extent.tier) {
            tier.used = tier.used.saturating_sub(extent.len as u64);
            if let Some(spill) = tier.files.get_mut(&layer) {
                spill.holes.push((extent.offset, extent.len));
            }
        }
    }

    /// Discard all spilled data.
    pub fn truncate_all(&mut self) -> Result<(), DiskIoError> {
        for tier in &mut self.tiers {
            for spill in tier.files.values_mut() {
                spill.file.set_len(0)?;
                spill.len = 0;
                spill.holes.clear();
            }
            tier.used = 0;
        }
        Ok(())
    }

    /// Live bytes on a tier.
    pub fn used(&self, tier: DiskTier) -> u64 {
        self.tiers
            .iter()
            .find(|t| t.tier == tier)
            .map(|t| t.used)
            .unwrap_or(0)
    }

    /// Budget of a tier (0 when not configured).
    pub fn budget(&self, tier: DiskTier) -> u64 {
        self.tiers
            .iter()
            .find(|t| t.tier == tier)
            .map(|t| t.budget)
            .unwrap_or(0)
    }

    /// Get disk I/O statistics.
    pub fn stats(&self) -> &DiskIoStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_extent() {
        let tmp = TempDir::new().unwrap();
        let mut store = SpillStore::new(Some((tmp.path().join("ssd"), 1 << 20)), None).unwrap();

        let a = store.append(0, &[1u8; 100]).unwrap();
        let b = store.append(0, &[2u8; 50]).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);
        assert!(tmp.path().join("ssd/layer_000.kvspill").exists());

        assert_eq!(store.read(0, &b).unwrap(), vec![2u8; 50]);
        assert_eq!(store.read(0, &a).unwrap(), vec![1u8; 100]);
        assert_eq!(store.used(DiskTier::Local), 150);
        assert_eq!(store.stats().total_reads, 2);
    }

    #[test]
    fn test_overflow_to_remote() {
        let tmp = TempDir::new().unwrap();
        let mut store = SpillStore::new(
            Some((tmp.path().join("ssd"), 120)),
            Some((tmp.path().join("nfs"), 1000)),
        )
        .unwrap();

        let a = store.append(3, &[1u8; 100]).unwrap();
        let b = store.append(3, &[2u8; 100]).unwrap();
        assert_eq!(a.tier, DiskTier::Local);
        assert_eq!(b.tier, DiskTier::Remote);
        assert_eq!(b.offset, 0);
        assert_eq!(store.read(3, &b).unwrap(), vec![2u8; 100]);

        store.release(3, &a);
        assert_eq!(store.used(DiskTier::Local), 0);
        let c = store.append(3, &[3u8; 10]).unwrap();
        assert_eq!(c.tier, DiskTier::Local);
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn test_released_extents_are_reused() {
        let tmp = TempDir::new().unwrap();
        let mut store = SpillStore::new(Some((tmp.path().join("ssd"), 1 << 20)), None).unwrap();
        let a = store.append(0, &[1u8; 40]).unwrap();
        store.append(0, &[2u8; 40]).unwrap();

        store.release(0, &a);
        let b = store.append(0, &[3u8; 30]).unwrap();
        let c = store.append(0, &[4u8; 10]).unwrap();
        assert_eq!((b.offset, c.offset), (0, 30));
        assert_eq!(store.read(0, &c).unwrap(), vec![4u8; 10]);
        let len = fs::metadata(tmp.path().join("ssd/layer_000.kvspill")).unwrap().len();
        assert_eq!(len, 80);
    }

    #[test]
    fn test_demote_moves_extent_to_remote() {
        let tmp = TempDir::new().unwrap();
        let mut store = SpillStore::new(
            Some((tmp.path().join("ssd"), 100)),
            Some((tmp.path().join("nfs"), 1000)),
        )
        .unwrap();
        let old = store.append(2, &[5u8; 80]).unwrap();
        assert_eq!(store.local_deficit(50), 30);
        assert_eq!(store.local_deficit(500), 0);

        let moved = store.demote(2, &old).unwrap();
        assert_eq!(moved.tier, DiskTier::Remote);
        assert_eq!(store.read(2, &moved).unwrap(), vec![5u8; 80]);
        assert_eq!(store.used(DiskTier::Local), 0);
        assert_eq!(store.used(DiskTier::Remote), 80);
        assert_eq!(store.local_deficit(50), 0);
    }

    #[test]
    fn test_budget_exhausted() {
        let tmp = TempDir::new().unwrap();
        let mut store = SpillStore::new(Some((tmp.path().join("ssd"), 64)), None).unwrap();
        store.append(0, &[0u8; 60]).unwrap();
        assert!(matches!(
            store.append(0, &[0u8; 10]),
            Err(DiskIoError::BudgetExhausted { needed: 10 })
        ));
    }

    #[test]
    fn test_no_tiers_configured() {
        let mut store = SpillStore::new(None, None).unwrap();
        assert!(!store.is_enabled());
        assert!(store.append(0, &[0u8; 1]).is_err());
    }

    #[test]
    fn test_truncate_resets() {
        let tmp = TempDir::new().unwrap();
        let mut store = SpillStore::new(Some((tmp.path().join("ssd"), 1 << 20)), None).unwrap();
        store.append(1, &[9u8; 32]).unwrap();
        store.truncate_all().unwrap();
        assert_eq!(store.used(DiskTier::Local), 0);
        let e = store.append(1, &[7u8; 8]).unwrap();
        assert_eq!(e.offset, 0);
        let len = fs::metadata(tmp.path().join("ssd/layer_001.kvspill")).unwrap().len();
        assert_eq!(len, 8);
    }
}
