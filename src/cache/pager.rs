//! Tier manager (pager): the public tiered KV store.
//!
//! The pager owns every layer, the host budget ledger, the spill files and
//! the staging buffer. It:
//! - Appends and overwrites positions, growing host windows within budget
//! - Spills the oldest host positions to disk when a window must slide
//! - Loads spilled positions back on read
//! - Serializes callers according to the configured [`LockingStrategy`]
//!
//! Lock order is always: global mutex, layer mutexes in ascending index,
//! then the shared tier state.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::compressor::{CompressionError, Compressor};
use crate::cache::evictor::Evictor;
use crate::cache::layer::{HostLedger, Layer, LayerEnv, TierState};
use crate::cache::residency::{DiskTier, Residency, Tier};
use crate::config::{ConfigError, LockingStrategy, StoreConfig};
use crate::error::ErrorClass;
use crate::gpu::memory::PinnedSlice;
use crate::transfer::disk_io::{DiskIoError, SpillStore};

#[derive(Error, Debug)]
pub enum PagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Layer {layer} out of range (store has {num_layers})")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("Row is {got} bytes, expected {expected}")]
    RowSize { expected: usize, got: usize },

    #[error("Position {pos} of layer {layer} is beyond the addressable {max}")]
    PositionOutOfRange { layer: usize, pos: usize, max: usize },

    #[error("Position {pos} of layer {layer} is absent")]
    AbsentPosition { layer: usize, pos: usize },

    #[error("Host budget cannot hold another position for layer {layer}")]
    HostBudgetExhausted { layer: usize },

    #[error("Disk tiers cannot hold a {needed}-byte extent")]
    DiskBudgetExhausted { needed: u64 },

    #[error("Spill I/O failed: {0}")]
    Disk(DiskIoError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("Store lock poisoned by a panicking caller")]
    Poisoned,
}

impl From<DiskIoError> for PagerError {
    fn from(err: DiskIoError) -> Self {
        match err {
            DiskIoError::BudgetExhausted { needed } => PagerError::DiskBudgetExhausted { needed },
            other => PagerError::Disk(other),
        }
    }
}

impl PagerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PagerError::Config(_) | PagerError::RowSize { .. } => ErrorClass::Config,
            PagerError::LayerOutOfRange { .. }
            | PagerError::PositionOutOfRange { .. }
            | PagerError::AbsentPosition { .. } => ErrorClass::Addressing,
            PagerError::HostBudgetExhausted { .. } | PagerError::DiskBudgetExhausted { .. } => {
                ErrorClass::Budget
            }
            PagerError::Disk(_) | PagerError::Compression(_) | PagerError::Poisoned => {
                ErrorClass::Device
            }
        }
    }

    pub fn status(&self) -> i32 {
        self.class().status()
    }
}

/// Host views of a contiguous run of positions of one layer.
///
/// The views alias store memory: they stay readable, but their contents
/// are only meaningful until the next call that touches the same layer.
#[derive(Debug, Clone, Default)]
pub struct KvRange {
    /// First position.
    pub start: usize,
    /// Positions returned, after clamping to the layer length.
    pub count: usize,
    /// Bytes per position of K (and of V).
    pub row_bytes: usize,
    pub k: PinnedSlice,
    pub v: PinnedSlice,
}

impl KvRange {
    pub(crate) fn empty(start: usize, row_bytes: usize) -> Self {
        Self {
            start,
            row_bytes,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// K bytes of the `i`-th returned position.
    pub fn k_row(&self, i: usize) -> Vec<u8> {
        let mut row = vec![0u8; self.row_bytes];
        self.k.copy_to(i * self.row_bytes, &mut row);
        row
    }

    /// V bytes of the `i`-th returned position.
    pub fn v_row(&self, i: usize) -> Vec<u8> {
        let mut row = vec![0u8; self.row_bytes];
        self.v.copy_to(i * self.row_bytes, &mut row);
        row
    }
}

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    /// Number of positions in this tier.
    pub position_count: usize,
    /// Total bytes used in this tier.
    pub bytes_used: u64,
    /// Capacity budget in bytes.
    pub capacity: u64,
}

/// Point-in-time snapshot of the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub host_used_bytes: u64,
    pub host_budget_bytes: u64,
    pub disk_local_used_bytes: u64,
    pub disk_local_budget_bytes: u64,
    pub disk_remote_used_bytes: u64,
    pub disk_remote_budget_bytes: u64,
    /// Sum of every layer's `count`, holes included.
    pub total_positions: usize,
    pub host_positions: usize,
    pub disk_positions: usize,
    pub disk_local_positions: usize,
    pub disk_remote_positions: usize,
    pub absent_positions: usize,
    /// Positions written to disk since creation.
    pub spilled_total: u64,
    /// Positions read back into a host window since creation.
    pub loaded_total: u64,
    /// Spill file traffic since creation.
    pub disk_bytes_written: u64,
    pub disk_bytes_read: u64,
}

impl StoreStats {
    pub fn tier(&self, tier: Tier) -> TierStats {
        match tier {
            Tier::Host => TierStats {
                position_count: self.host_positions,
                bytes_used: self.host_used_bytes,
                capacity: self.host_budget_bytes,
            },
            Tier::LocalDisk => TierStats {
                position_count: self.disk_local_positions,
                bytes_used: self.disk_local_used_bytes,
                capacity: self.disk_local_budget_bytes,
            },
            Tier::RemoteDisk => TierStats {
                position_count: self.disk_remote_positions,
                bytes_used: self.disk_remote_used_bytes,
                capacity: self.disk_remote_budget_bytes,
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PagerError> {
    mutex.lock().map_err(|_| PagerError::Poisoned)
}

/// The tiered KV store.
pub struct Pager {
    config: StoreConfig,

    /// Held for the whole call under [`LockingStrategy::Global`].
    global: Mutex<()>,

    layers: Vec<Mutex<Layer>>,

    /// Budget ledger, spill files, staging buffer.
    tiers: Mutex<TierState>,

    compressor: Compressor,

    evictor: Evictor,
}

impl Pager {
    /// Validate `config`, prepare the spill directories and create an
    /// empty store.
    pub fn new(config: StoreConfig) -> Result<Self, PagerError> {
        config.validate()?;

        let tier_cfg = |path: &Option<std::path::PathBuf>, budget: u64| {
            path.as_ref().map(|p| (p.clone(), budget))
        };
        let local = tier_cfg(&config.local_disk_path, config.local_disk_budget);
        let remote = tier_cfg(&config.remote_disk_path, config.remote_disk_budget);
        let spill = SpillStore::new(local, remote).map_err(|source| ConfigError::Directory {
            path: config
                .local_disk_path
                .clone()
                .or_else(|| config.remote_disk_path.clone())
                .unwrap_or_default(),
            source,
        })?;
        if !spill.is_enabled() {
            warn!("No disk tier configured; the store is limited to the host budget");
        }

        let row_bytes = config.row_bytes();
        let layers = (0..config.num_layers)
            .map(|i| Mutex::new(Layer::new(i, row_bytes, config.max_positions)))
            .collect();
        let ledger = HostLedger::new(config.host_budget_bytes, config.num_layers);

        info!(
            num_layers = config.num_layers,
            row_bytes,
            host_budget = config.host_budget_bytes,
            positions_per_layer = config.positions_per_layer(),
            locking = ?config.locking,
            "Created tiered KV store"
        );

        Ok(Self {
            compressor: Compressor::new(config.compression.clone()),
            evictor: Evictor::new(config.eviction.clone()),
            global: Mutex::new(()),
            layers,
            tiers: Mutex::new(TierState::new(ledger, spill)),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Bytes per position of K (and of V).
    pub fn row_bytes(&self) -> usize {
        self.config.row_bytes()
    }

    fn env(&self) -> LayerEnv<'_> {
        LayerEnv {
            tiers: &self.tiers,
            compressor: &self.compressor,
            evictor: &self.evictor,
        }
    }

    fn serialize(&self) -> Result<Option<MutexGuard<'_, ()>>, PagerError> {
        match self.config.locking {
            LockingStrategy::Global => lock(&self.global).map(Some),
            LockingStrategy::PerLayer => Ok(None),
        }
    }

    fn layer(&self, layer: usize) -> Result<MutexGuard<'_, Layer>, PagerError> {
        let mutex = self.layers.get(layer).ok_or(PagerError::LayerOutOfRange {
            layer,
            num_layers: self.layers.len(),
        })?;
        lock(mutex)
    }

    fn check_rows(&self, k_row: &[u8], v_row: &[u8]) -> Result<(), PagerError> {
        let expected = self.row_bytes();
        for got in [k_row.len(), v_row.len()] {
            if got != expected {
                return Err(PagerError::RowSize { expected, got });
            }
        }
        Ok(())
    }

    /// Append one position at the end of `layer`. Returns its index.
    pub fn append(&self, layer: usize, k_row: &[u8], v_row: &[u8]) -> Result<usize, PagerError> {
        self.check_rows(k_row, v_row)?;
        let _serial = self.serialize()?;
        let mut lyr = self.layer(layer)?;
        let pos = lyr.count();
        lyr.put(pos, k_row, v_row, &self.env())?;
        Ok(pos)
    }

    /// Write (or overwrite) position `pos` of `layer`. Writing past the end
    /// extends the layer; skipped positions stay absent.
    pub fn store(&self, layer: usize, pos: usize, k_row: &[u8], v_row: &[u8]) -> Result<(), PagerError> {
        self.check_rows(k_row, v_row)?;
        let _serial = self.serialize()?;
        let mut lyr = self.layer(layer)?;
        lyr.put(pos, k_row, v_row, &self.env())
    }

    /// Host views of `count` positions starting at `start`, clamped to the
    /// layer length. Spilled positions are loaded back first. Ranges
    /// containing absent positions are rejected.
    pub fn get_range(&self, layer: usize, start: usize, count: usize) -> Result<KvRange, PagerError> {
        let _serial = self.serialize()?;
        let mut lyr = self.layer(layer)?;
        lyr.range(start, count, &self.env())
    }

    /// Every position of `layer`.
    pub fn get_layer(&self, layer: usize) -> Result<KvRange, PagerError> {
        let _serial = self.serialize()?;
        let mut lyr = self.layer(layer)?;
        let count = lyr.count();
        lyr.range(0, count, &self.env())
    }

    /// Mark `[start, start + count)` absent in every layer.
    pub fn remove_range(&self, start: usize, count: usize) -> Result<(), PagerError> {
        let _serial = self.serialize()?;
        let env = self.env();
        for mutex in &self.layers {
            lock(mutex)?.remove(start, count, &env)?;
        }
        info!(start, count, "Removed range from all layers");
        Ok(())
    }

    /// Reset every layer to zero positions and discard spilled data.
    /// Host allocations are kept for reuse.
    pub fn clear(&self) -> Result<(), PagerError> {
        let _serial = self.serialize()?;
        let mut guards = Vec::with_capacity(self.layers.len());
        for mutex in &self.layers {
            guards.push(lock(mutex)?);
        }
        for lyr in guards.iter_mut() {
            lyr.clear();
        }
        lock(&self.tiers)?.spill.truncate_all()?;
        info!("Cleared store");
        Ok(())
    }

    /// Logical length (high-water mark) of `layer`.
    pub fn layer_len(&self, layer: usize) -> Result<usize, PagerError> {
        let _serial = self.serialize()?;
        Ok(self.layer(layer)?.count())
    }

    /// Host window capacity of `layer`, in positions.
    pub fn layer_capacity(&self, layer: usize) -> Result<usize, PagerError> {
        let _serial = self.serialize()?;
        Ok(self.layer(layer)?.capacity())
    }

    pub fn residency(&self, layer: usize, pos: usize) -> Result<Residency, PagerError> {
        let _serial = self.serialize()?;
        Ok(self.layer(layer)?.residency(pos))
    }

    /// Point-in-time snapshot. Layers are visited one at a time.
    pub fn get_stats(&self) -> Result<StoreStats, PagerError> {
        let _serial = self.serialize()?;
        let mut stats = StoreStats::default();
        for mutex in &self.layers {
            lock(mutex)?.accumulate(&mut stats);
        }
        let tiers = lock(&self.tiers)?;
        stats.host_used_bytes = tiers.ledger.used();
        stats.host_budget_bytes = tiers.ledger.budget();
        stats.disk_local_used_bytes = tiers.spill.used(DiskTier::Local);
        stats.disk_local_budget_bytes = tiers.spill.budget(DiskTier::Local);
        stats.disk_remote_used_bytes = tiers.spill.used(DiskTier::Remote);
        stats.disk_remote_budget_bytes = tiers.spill.budget(DiskTier::Remote);
        stats.spilled_total = tiers.spilled_total;
        stats.loaded_total = tiers.loaded_total;
        stats.disk_bytes_written = tiers.spill.stats().total_bytes_written;
        stats.disk_bytes_read = tiers.spill.stats().total_bytes_read;
        Ok(stats)
    }
}

/// Thread-safe handle to the store.
pub type SharedPager = Arc<Pager>;

/// Create a new shareable store.
pub fn new_shared_pager(config: StoreConfig) -> Result<SharedPager, PagerError> {
    Ok(Arc::new(Pager::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> StoreConfig {
        StoreConfig {
            num_layers: 2,
            num_kv_heads: 1,
            head_dim: 4,
            elem_bytes: 2,
            host_budget_bytes: 1 << 20,
            local_disk_path: Some(tmp.path().join("ssd")),
            local_disk_budget: 1 << 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_pager_append_and_stats() {
        let tmp = TempDir::new().unwrap();
        let pager = Pager::new(test_config(&tmp)).unwrap();

        assert_eq!(pager.append(0, &[1; 8], &[2; 8]).unwrap(), 0);
        assert_eq!(pager.append(0, &[3; 8], &[4; 8]).unwrap(), 1);

        let stats = pager.get_stats().unwrap();
        assert_eq!(stats.total_positions, 2);
        assert_eq!(stats.host_positions, 2);
        // One layer grew to the initial 256 positions.
        assert_eq!(stats.host_used_bytes, 256 * 8 * 2);
        assert_eq!(stats.tier(Tier::Host).position_count, 2);
    }

    #[test]
    fn test_row_size_checked() {
        let tmp = TempDir::new().unwrap();
        let pager = Pager::new(test_config(&tmp)).unwrap();
        let err = pager.append(0, &[0; 4], &[0; 8]).unwrap_err();
        assert!(matches!(err, PagerError::RowSize { expected: 8, got: 4 }));
        assert_eq!(err.status(), -1);
    }

    #[test]
    fn test_layer_out_of_range() {
        let tmp = TempDir::new().unwrap();
        let pager = Pager::new(test_config(&tmp)).unwrap();
        let err = pager.get_range(2, 0, 1).unwrap_err();
        assert!(matches!(err, PagerError::LayerOutOfRange { layer: 2, num_layers: 2 }));
        assert_eq!(err.class(), ErrorClass::Addressing);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            num_layers: 0,
            ..test_config(&tmp)
        };
        assert!(matches!(Pager::new(config), Err(PagerError::Config(_))));
    }

    #[test]
    fn test_clear_keeps_allocations() {
        let tmp = TempDir::new().unwrap();
        let pager = Pager::new(test_config(&tmp)).unwrap();
        for _ in 0..4 {
            pager.append(1, &[5; 8], &[6; 8]).unwrap();
        }
        let used = pager.get_stats().unwrap().host_used_bytes;

        pager.clear().unwrap();
        let stats = pager.get_stats().unwrap();
        assert_eq!(stats.total_positions, 0);
        assert_eq!(stats.host_used_bytes, used);
        assert_eq!(pager.append(1, &[7; 8], &[8; 8]).unwrap(), 0);
    }

    #[test]
    fn test_disk_budget_error_is_budget_class() {
        let err = PagerError::from(DiskIoError::BudgetExhausted { needed: 10 });
        assert!(matches!(err, PagerError::DiskBudgetExhausted { needed: 10 }));
        assert_eq!(err.status(), -2);
    }
}
