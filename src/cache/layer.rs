//! One layer of the tiered store.
//!
//! The layer's K and V host buffers form a window of `capacity` slots over
//! the position space: slot `i` holds position `base + i`. Positions inside
//! the window may be `Host`; positions outside it are `Disk` or `Absent`.
//! `count` is the high-water mark (highest occupied position + 1), not the
//! number of live positions.
//!
//! A spilled position that is loaded back keeps its extent as a clean disk
//! copy until it is rewritten, so evicting it again writes nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::cache::compressor::Compressor;
use crate::cache::evictor::Evictor;
use crate::cache::pager::{KvRange, PagerError, StoreStats};
use crate::cache::residency::{DiskExtent, DiskTier, Residency};
use crate::config::MIN_LAYER_CAPACITY;
use crate::gpu::memory::PinnedBuffer;
use crate::transfer::disk_io::{DiskIoError, SpillStore};

/// Host budget accounting shared by all layers.
#[derive(Debug)]
pub(crate) struct HostLedger {
    budget: u64,
    layer_share: u64,
    used: u64,
}

impl HostLedger {
    pub(crate) fn new(budget: u64, num_layers: usize) -> Self {
        Self {
            budget,
            layer_share: budget / num_layers.max(1) as u64,
            used: 0,
        }
    }

    /// Grant up to `rows` more rows of `row_cost` bytes to a layer that
    /// currently holds `layer_bytes`. Clamped to the remaining budget and to
    /// the layer's share of it.
    fn grant_rows(&mut self, layer_bytes: u64, rows: usize, row_cost: u64) -> usize {
        if row_cost == 0 {
            return 0;
        }
        let room = self
            .budget
            .saturating_sub(self.used)
            .min(self.layer_share.saturating_sub(layer_bytes));
        let granted = rows.min((room / row_cost) as usize);
        self.used += granted as u64 * row_cost;
        granted
    }

    pub(crate) fn used(&self) -> u64 {
        self.used
    }

    pub(crate) fn budget(&self) -> u64 {
        self.budget
    }
}

/// Staging buffers for ranges that do not fit in a layer's window.
#[derive(Debug, Default)]
pub(crate) struct Staging {
    k: PinnedBuffer,
    v: PinnedBuffer,
}

impl Staging {
    /// Buffers of at least `bytes` each. Reused unless a caller still holds
    /// a view of the previous contents.
    fn acquire(&mut self, bytes: usize) -> (PinnedBuffer, PinnedBuffer) {
        if self.k.is_shared() || self.v.is_shared() {
            debug!(bytes, "Staging buffer in use, allocating a fresh one");
            self.k = PinnedBuffer::default();
            self.v = PinnedBuffer::default();
        }
        for buf in [&self.k, &self.v] {
            let mut data = buf.write();
            if data.len() < bytes {
                data.resize(bytes, 0);
            }
        }
        (self.k.clone(), self.v.clone())
    }
}

/// State shared by all layers: budget ledger, spill files, staging.
#[derive(Debug)]
pub(crate) struct TierState {
    pub(crate) ledger: HostLedger,
    pub(crate) spill: SpillStore,
    pub(crate) staging: Staging,
    pub(crate) spilled_total: u64,
    pub(crate) loaded_total: u64,
}

impl TierState {
    pub(crate) fn new(ledger: HostLedger, spill: SpillStore) -> Self {
        Self {
            ledger,
            spill,
            staging: Staging::default(),
            spilled_total: 0,
            loaded_total: 0,
        }
    }
}

/// What a layer operation needs besides the layer itself.
pub(crate) struct LayerEnv<'a> {
    pub(crate) tiers: &'a Mutex<TierState>,
    pub(crate) compressor: &'a Compressor,
    pub(crate) evictor: &'a Evictor,
}

impl<'a> LayerEnv<'a> {
    fn tiers(&self) -> Result<MutexGuard<'a, TierState>, PagerError> {
        self.tiers.lock().map_err(|_| PagerError::Poisoned)
    }
}

#[derive(Debug)]
pub(crate) struct Layer {
    index: usize,
    row_bytes: usize,
    max_positions: usize,
    k: PinnedBuffer,
    v: PinnedBuffer,
    capacity: usize,
    base: usize,
    count: usize,
    meta: Vec<Residency>,
    /// Disk copies of host positions that have not been rewritten since
    /// they were loaded.
    clean: HashMap<usize, DiskExtent>,
}

impl Layer {
    pub(crate) fn new(index: usize, row_bytes: usize, max_positions: usize) -> Self {
        Self {
            index,
            row_bytes,
            max_positions,
            k: PinnedBuffer::default(),
            v: PinnedBuffer::default(),
            capacity: 0,
            base: 0,
            count: 0,
            meta: Vec::new(),
            clean: HashMap::new(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn residency(&self, pos: usize) -> Residency {
        self.meta.get(pos).copied().unwrap_or_default()
    }

    fn slot(&self, pos: usize) -> Option<usize> {
        (pos >= self.base && pos < self.base + self.capacity).then(|| pos - self.base)
    }

    fn set_meta(&mut self, pos: usize, residency: Residency) {
        if self.meta.len() <= pos {
            self.meta.resize(pos + 1, Residency::Absent);
        }
        self.meta[pos] = residency;
    }

    fn write_slot(&self, slot: usize, k_row: &[u8], v_row: &[u8]) {
        let rb = self.row_bytes;
        self.k.write()[slot * rb..(slot + 1) * rb].copy_from_slice(k_row);
        self.v.write()[slot * rb..(slot + 1) * rb].copy_from_slice(v_row);
    }

    /// Grow the window so that it spans `needed` slots, within budget.
    fn grow(&mut self, needed: usize, env: &LayerEnv<'_>) -> Result<(), PagerError> {
        let mut target = if self.capacity == 0 {
            MIN_LAYER_CAPACITY
        } else {
            self.capacity
        };
        while target < needed {
            target = target.saturating_mul(2);
        }
        let row_cost = (self.row_bytes * 2) as u64;
        let granted = env.tiers()?.ledger.grant_rows(
            self.capacity as u64 * row_cost,
            target - self.capacity,
            row_cost,
        );
        if granted == 0 {
            return Ok(());
        }
        let new_cap = self.capacity + granted;
        self.k.write().resize(new_cap * self.row_bytes, 0);
        self.v.write().resize(new_cap * self.row_bytes, 0);
        debug!(
            layer = self.index,
            from = self.capacity,
            to = new_cap,
            "Grew host window"
        );
        self.capacity = new_cap;
        Ok(())
    }

    /// Write `payload` as a new extent of this layer.
    ///
    /// When the local tier is short of room, this layer's oldest local
    /// extents move to the remote tier first so the newest spill stays
    /// local. When every tier is full, clean disk copies are dropped.
    fn write_extent(&mut self, payload: &[u8], tiers: &mut TierState) -> Result<DiskExtent, PagerError> {
        self.demote_oldest(payload.len() as u64, tiers)?;
        match tiers.spill.append(self.index, payload) {
            Err(DiskIoError::BudgetExhausted { .. }) if !self.clean.is_empty() => {
                debug!(layer = self.index, dropped = self.clean.len(), "Dropping clean disk copies");
                for (_, extent) in self.clean.drain() {
                    tiers.spill.release(self.index, &extent);
                }
                Ok(tiers.spill.append(self.index, payload)?)
            }
            result => Ok(result?),
        }
    }

    /// Move spilled positions from the local to the remote tier, oldest
    /// first, until the local tier can take `needed` more bytes.
    fn demote_oldest(&mut self, needed: u64, tiers: &mut TierState) -> Result<(), PagerError> {
        let deficit = tiers.spill.local_deficit(needed);
        if deficit == 0 {
            return Ok(());
        }
        let (mut freed, mut moved) = (0u64, 0usize);
        for pos in 0..self.meta.len() {
            if freed >= deficit {
                break;
            }
            let Residency::Disk(extent) = self.meta[pos] else {
                continue;
            };
            if extent.tier != DiskTier::Local {
                continue;
            }
            match tiers.spill.demote(self.index, &extent) {
                Ok(remote) => {
                    self.meta[pos] = Residency::Disk(remote);
                    freed += extent.len as u64;
                    moved += 1;
                }
                Err(DiskIoError::BudgetExhausted { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if moved > 0 {
            info!(layer = self.index, demoted = moved, freed, "Demoted oldest extents to the remote tier");
        }
        Ok(())
    }

    /// Release whatever disk copy `pos` has.
    fn forget_disk_copy(&mut self, pos: usize, tiers: &mut TierState) {
        let extent = self.clean.remove(&pos).or_else(|| self.residency(pos).extent());
        if let Some(extent) = extent {
            tiers.spill.release(self.index, &extent);
        }
    }

    /// Spill the row at `pos` (which must be in the window). A clean disk
    /// copy is reused as is.
    fn spill_position(&mut self, pos: usize, env: &LayerEnv<'_>, tiers: &mut TierState) -> Result<(), PagerError> {
        if let Some(extent) = self.clean.remove(&pos) {
            self.set_meta(pos, Residency::Disk(extent));
            return Ok(());
        }
        let slot = pos - self.base;
        let rb = self.row_bytes;
        let payload = {
            let k = self.k.read();
            let v = self.v.read();
            env.compressor
                .pack(&k[slot * rb..(slot + 1) * rb], &v[slot * rb..(slot + 1) * rb])?
        };
        let extent = self.write_extent(&payload, tiers)?;
        self.set_meta(pos, Residency::Disk(extent));
        tiers.spilled_total += 1;
        Ok(())
    }

    /// Decompress a spilled position into its window slot. The extent is
    /// kept as the position's clean disk copy.
    fn load_position(
        &mut self,
        pos: usize,
        extent: DiskExtent,
        env: &LayerEnv<'_>,
        tiers: &mut TierState,
    ) -> Result<(), PagerError> {
        let slot = pos - self.base;
        let rb = self.row_bytes;
        let payload = tiers.spill.read(self.index, &extent)?;
        {
            let mut k = self.k.write();
            let mut v = self.v.write();
            env.compressor.unpack(
                &payload,
                &mut k[slot * rb..(slot + 1) * rb],
                &mut v[slot * rb..(slot + 1) * rb],
            )?;
        }
        self.clean.insert(pos, extent);
        self.set_meta(pos, Residency::Host);
        tiers.loaded_total += 1;
        Ok(())
    }

    /// Move the window to start at `new_base`, spilling host positions that
    /// fall outside it.
    fn slide_to(&mut self, new_base: usize, env: &LayerEnv<'_>) -> Result<(), PagerError> {
        if new_base == self.base {
            return Ok(());
        }
        let (base, cap) = (self.base, self.capacity);
        let leaving = if new_base > base {
            base..new_base.min(base + cap)
        } else {
            (new_base + cap).max(base)..base + cap
        };

        let victims = env.evictor.select_victims(&self.meta, leaving);
        if !victims.is_empty() {
            let mut tiers = env.tiers()?;
            for &pos in &victims {
                self.spill_position(pos, env, &mut tiers)?;
            }
            info!(
                layer = self.index,
                spilled = victims.len(),
                first = victims[0],
                "Spilled positions to disk"
            );
        }

        let rb = self.row_bytes;
        if new_base > base {
            let shift = new_base - base;
            if shift < cap {
                self.k.write().copy_within(shift * rb..cap * rb, 0);
                self.v.write().copy_within(shift * rb..cap * rb, 0);
            }
        } else {
            let shift = base - new_base;
            if shift < cap {
                self.k.write().copy_within(0..(cap - shift) * rb, shift * rb);
                self.v.write().copy_within(0..(cap - shift) * rb, shift * rb);
            }
        }
        debug!(layer = self.index, from = base, to = new_base, "Moved host window");
        self.base = new_base;
        Ok(())
    }

    /// Make `pos` addressable in the window, growing or sliding forward.
    /// `pos` must not be below the window.
    fn ensure_slot(&mut self, pos: usize, env: &LayerEnv<'_>) -> Result<usize, PagerError> {
        if let Some(slot) = self.slot(pos) {
            return Ok(slot);
        }
        self.grow((pos - self.base).saturating_add(1), env)?;
        if let Some(slot) = self.slot(pos) {
            return Ok(slot);
        }
        match env.evictor.plan_slide(self.base, self.capacity, pos) {
            Some(new_base) => self.slide_to(new_base, env)?,
            None => {
                return Err(PagerError::HostBudgetExhausted { layer: self.index });
            }
        }
        self.slot(pos)
            .ok_or(PagerError::HostBudgetExhausted { layer: self.index })
    }

    /// Whether the window can move back to start at `pos` without spilling.
    fn can_rewind_to(&self, pos: usize, env: &LayerEnv<'_>) -> bool {
        let top = self.base + self.capacity;
        env.evictor
            .select_victims(&self.meta, pos.saturating_add(self.capacity).max(self.base)..top)
            .is_empty()
    }

    /// Write one position's rows. Returns nothing; `count` is updated.
    pub(crate) fn put(
        &mut self,
        pos: usize,
        k_row: &[u8],
        v_row: &[u8],
        env: &LayerEnv<'_>,
    ) -> Result<(), PagerError> {
        if pos >= self.max_positions {
            return Err(PagerError::PositionOutOfRange {
                layer: self.index,
                pos,
                max: self.max_positions,
            });
        }
        if pos < self.base && !self.can_rewind_to(pos, env) {
            return self.write_through(pos, k_row, v_row, env);
        }
        if pos < self.base {
            self.slide_to(pos, env)?;
        }

        let slot = self.ensure_slot(pos, env)?;
        self.write_slot(slot, k_row, v_row);
        if self.clean.contains_key(&pos) || self.residency(pos).extent().is_some() {
            self.forget_disk_copy(pos, &mut *env.tiers()?);
        }
        self.set_meta(pos, Residency::Host);
        if pos >= self.count {
            self.count = pos + 1;
        }
        Ok(())
    }

    /// Store a position older than the window straight to disk.
    fn write_through(
        &mut self,
        pos: usize,
        k_row: &[u8],
        v_row: &[u8],
        env: &LayerEnv<'_>,
    ) -> Result<(), PagerError> {
        let payload = env.compressor.pack(k_row, v_row)?;
        let mut tiers = env.tiers()?;
        let extent = self.write_extent(&payload, &mut tiers)?;
        self.forget_disk_copy(pos, &mut tiers);
        tiers.spilled_total += 1;
        self.set_meta(pos, Residency::Disk(extent));
        if pos >= self.count {
            self.count = pos + 1;
        }
        debug!(layer = self.index, pos, "Wrote position through to disk");
        Ok(())
    }

    /// Host view of `[start, start + count)`, clamped to the layer length.
    pub(crate) fn range(
        &mut self,
        start: usize,
        count: usize,
        env: &LayerEnv<'_>,
    ) -> Result<KvRange, PagerError> {
        let actual = count.min(self.count.saturating_sub(start));
        if actual == 0 {
            return Ok(KvRange::empty(start, self.row_bytes));
        }
        let end = start + actual;
        if let Some(pos) = (start..end).find(|&p| self.residency(p).is_absent()) {
            return Err(PagerError::AbsentPosition {
                layer: self.index,
                pos,
            });
        }

        if actual > self.capacity {
            return self.stage(start, actual, env);
        }

        if start < self.base {
            self.slide_to(start, env)?;
        } else if end > self.base + self.capacity {
            self.slide_to(end - self.capacity, env)?;
        }

        let spilled: Vec<(usize, DiskExtent)> = (start..end)
            .filter_map(|p| self.residency(p).extent().map(|e| (p, e)))
            .collect();
        if !spilled.is_empty() {
            let mut tiers = env.tiers()?;
            for &(pos, extent) in &spilled {
                self.load_position(pos, extent, env, &mut tiers)?;
            }
            debug!(layer = self.index, loaded = spilled.len(), "Loaded positions from disk");
        }

        let rb = self.row_bytes;
        let offset = (start - self.base) * rb;
        Ok(KvRange {
            start,
            count: actual,
            row_bytes: rb,
            k: self.k.slice(offset, actual * rb),
            v: self.v.slice(offset, actual * rb),
        })
    }

    /// Assemble a range larger than the window in the staging buffers.
    /// Residency is left unchanged.
    fn stage(&mut self, start: usize, count: usize, env: &LayerEnv<'_>) -> Result<KvRange, PagerError> {
        let rb = self.row_bytes;
        let mut tiers = env.tiers()?;
        let (k_buf, v_buf) = tiers.staging.acquire(count * rb);
        {
            let mut k_dst = k_buf.write();
            let mut v_dst = v_buf.write();
            let k_src = self.k.read();
            let v_src = self.v.read();
            for i in 0..count {
                let pos = start + i;
                let dst = i * rb..(i + 1) * rb;
                match self.residency(pos) {
                    Residency::Host => {
                        let slot = pos - self.base;
                        k_dst[dst.clone()].copy_from_slice(&k_src[slot * rb..(slot + 1) * rb]);
                        v_dst[dst].copy_from_slice(&v_src[slot * rb..(slot + 1) * rb]);
                    }
                    Residency::Disk(extent) => {
                        let payload = tiers.spill.read(self.index, &extent)?;
                        env.compressor
                            .unpack(&payload, &mut k_dst[dst.clone()], &mut v_dst[dst])?;
                    }
                    Residency::Absent => {
                        return Err(PagerError::AbsentPosition {
                            layer: self.index,
                            pos,
                        });
                    }
                }
            }
        }
        debug!(layer = self.index, start, count, "Staged range larger than host window");
        Ok(KvRange {
            start,
            count,
            row_bytes: rb,
            k: k_buf.slice(0, count * rb),
            v: v_buf.slice(0, count * rb),
        })
    }

    /// Mark `[start, start + count)` absent, shrinking `count` when the
    /// removal reaches the tail.
    pub(crate) fn remove(&mut self, start: usize, count: usize, env: &LayerEnv<'_>) -> Result<(), PagerError> {
        if start >= self.count {
            return Ok(());
        }
        let end = start.saturating_add(count).min(self.count);

        let has_copies = (start..end)
            .any(|p| self.clean.contains_key(&p) || self.residency(p).extent().is_some());
        if has_copies {
            let mut tiers = env.tiers()?;
            for pos in start..end {
                self.forget_disk_copy(pos, &mut tiers);
            }
        }
        for pos in start..end {
            self.meta[pos] = Residency::Absent;
        }

        if end >= self.count {
            self.count = (0..start)
                .rev()
                .find(|&p| !self.meta[p].is_absent())
                .map_or(0, |p| p + 1);
        }
        debug!(layer = self.index, start, end, count = self.count, "Removed range");
        Ok(())
    }

    /// Drop every position. Host allocations are kept.
    pub(crate) fn clear(&mut self) {
        self.meta.clear();
        self.clean.clear();
        self.count = 0;
        self.base = 0;
    }

    /// Add this layer's position counts to `stats`.
    pub(crate) fn accumulate(&self, stats: &mut StoreStats) {
        stats.total_positions += self.count;
        for residency in self.meta.iter().take(self.count) {
            match residency {
                Residency::Host => stats.host_positions += 1,
                Residency::Disk(extent) => {
                    stats.disk_positions += 1;
                    match extent.tier {
                        DiskTier::Local => stats.disk_local_positions += 1,
                        DiskTier::Remote => stats.disk_remote_positions += 1,
                    }
                }
                Residency::Absent => stats.absent_positions += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionConfig, EvictionConfig};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        tiers: Mutex<TierState>,
        compressor: Compressor,
        evictor: Evictor,
    }

    impl Fixture {
        fn new(budget: u64, spill_batch: usize) -> Self {
            let tmp = TempDir::new().unwrap();
            let spill = SpillStore::new(Some((tmp.path().join("ssd"), 1 << 20)), None).unwrap();
            Self {
                tiers: Mutex::new(TierState::new(HostLedger::new(budget, 1), spill)),
                compressor: Compressor::new(CompressionConfig::default()),
                evictor: Evictor::new(EvictionConfig { spill_batch }),
                _tmp: tmp,
            }
        }

        fn env(&self) -> LayerEnv<'_> {
            LayerEnv {
                tiers: &self.tiers,
                compressor: &self.compressor,
                evictor: &self.evictor,
            }
        }
    }

    fn row(pos: usize, salt: u8) -> Vec<u8> {
        (0..8).map(|i| (pos as u8).wrapping_mul(7) ^ salt ^ i).collect()
    }

    #[test]
    fn test_ledger_clamps_to_share() {
        let mut ledger = HostLedger::new(1000, 2);
        // Share is 500 bytes; 16-byte rows.
        assert_eq!(ledger.grant_rows(0, 256, 16), 31);
        assert_eq!(ledger.used(), 31 * 16);
        assert_eq!(ledger.grant_rows(31 * 16, 10, 16), 0);
    }

    #[test]
    fn test_window_slides_and_spills_oldest() {
        // 8 positions of 16 bytes fit in the budget.
        let fx = Fixture::new(128, 4);
        let env = fx.env();
        let mut layer = Layer::new(0, 8, 1 << 16);

        for pos in 0..10 {
            layer.put(pos, &row(pos, 1), &row(pos, 2), &env).unwrap();
        }
        assert_eq!(layer.capacity(), 8);
        assert_eq!(layer.count(), 10);
        // Slide by the batch of 4: positions 0..4 spilled.
        for pos in 0..4 {
            assert!(layer.residency(pos).extent().is_some(), "pos {pos}");
        }
        for pos in 4..10 {
            assert!(layer.residency(pos).is_host(), "pos {pos}");
        }
    }

    #[test]
    fn test_range_pages_back_in() {
        let fx = Fixture::new(128, 4);
        let env = fx.env();
        let mut layer = Layer::new(0, 8, 1 << 16);
        for pos in 0..12 {
            layer.put(pos, &row(pos, 1), &row(pos, 2), &env).unwrap();
        }

        let range = layer.range(0, 3, &env).unwrap();
        assert_eq!(range.count, 3);
        assert_eq!(range.k_row(1), row(1, 1));
        assert_eq!(range.v_row(2), row(2, 2));
        assert!(layer.residency(0).is_host());
        // Moving the window back spilled the newest positions.
        assert!(layer.residency(11).extent().is_some());
    }

    #[test]
    fn test_reloaded_position_respills_in_place() {
        let fx = Fixture::new(128, 4);
        let env = fx.env();
        let mut layer = Layer::new(0, 8, 1 << 16);
        for pos in 0..12 {
            layer.put(pos, &row(pos, 1), &row(pos, 2), &env).unwrap();
        }
        let first = layer.residency(0).extent().unwrap();

        layer.range(0, 4, &env).unwrap();
        let written = fx.tiers.lock().unwrap().spill.stats().total_writes;

        // Sliding forward again evicts 0..4 without writing them.
        layer.range(8, 4, &env).unwrap();
        assert_eq!(fx.tiers.lock().unwrap().spill.stats().total_writes, written);
        assert_eq!(layer.residency(0).extent(), Some(first));

        // A rewrite drops the clean copy, so the next eviction writes.
        layer.range(0, 4, &env).unwrap();
        layer.put(0, &row(50, 1), &row(50, 2), &env).unwrap();
        layer.range(8, 4, &env).unwrap();
        let tiers = fx.tiers.lock().unwrap();
        assert_eq!(tiers.spill.stats().total_writes, written + 1);
        drop(tiers);
        let range = layer.range(0, 1, &env).unwrap();
        assert_eq!(range.k_row(0), row(50, 1));
    }

    #[test]
    fn test_oversized_range_is_staged() {
        let fx = Fixture::new(128, 4);
        let env = fx.env();
        let mut layer = Layer::new(0, 8, 1 << 16);
        for pos in 0..20 {
            layer.put(pos, &row(pos, 1), &row(pos, 2), &env).unwrap();
        }

        let range = layer.range(0, 20, &env).unwrap();
        assert_eq!(range.count, 20);
        let k = range.k.to_vec();
        for pos in 0..20 {
            assert_eq!(&k[pos * 8..(pos + 1) * 8], row(pos, 1).as_slice());
        }
        // Staging does not change residency.
        assert!(layer.residency(0).extent().is_some());
    }

    #[test]
    fn test_store_below_window_writes_through() {
        let fx = Fixture::new(128, 4);
        let env = fx.env();
        let mut layer = Layer::new(0, 8, 1 << 16);
        for pos in 0..12 {
            layer.put(pos, &row(pos, 1), &row(pos, 2), &env).unwrap();
        }
        let before = layer.residency(1).extent().unwrap();
        layer.put(1, &row(99, 1), &row(99, 2), &env).unwrap();
        let after = layer.residency(1).extent().unwrap();
        assert_ne!(before.offset, after.offset);

        let range = layer.range(1, 1, &env).unwrap();
        assert_eq!(range.k_row(0), row(99, 1));
    }

    #[test]
    fn test_no_budget_fails() {
        let fx = Fixture::new(8, 4);
        let env = fx.env();
        let mut layer = Layer::new(0, 8, 1 << 16);
        assert!(matches!(
            layer.put(0, &row(0, 1), &row(0, 2), &env),
            Err(PagerError::HostBudgetExhausted { layer: 0 })
        ));
        assert_eq!(layer.count(), 0);
    }
}
