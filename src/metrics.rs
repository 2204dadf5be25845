//! Prometheus export of store and attention statistics.
//!
//! Stats are snapshots, so everything is exported as a gauge set from the
//! latest snapshot rather than incremented in the hot path.

use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};

use crate::attention::context::AttentionStats;
use crate::cache::pager::StoreStats;

pub struct Metrics {
    registry: Registry,

    host_used_bytes: IntGauge,
    host_budget_bytes: IntGauge,
    disk_local_used_bytes: IntGauge,
    disk_remote_used_bytes: IntGauge,
    host_positions: IntGauge,
    disk_positions: IntGauge,
    absent_positions: IntGauge,
    spilled_total: IntGauge,
    loaded_total: IntGauge,

    forward_calls: IntGauge,
    chunks_processed: IntGauge,
    bytes_transferred: IntGauge,
    transfer_time_ms: Gauge,
    compute_time_ms: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("kv_tier_attn".into()), None)?;

        let int_gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge, prometheus::Error> {
            let gauge = Gauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            host_used_bytes: int_gauge("store_host_used_bytes", "Host bytes allocated to layer windows")?,
            host_budget_bytes: int_gauge("store_host_budget_bytes", "Configured host budget")?,
            disk_local_used_bytes: int_gauge("store_disk_local_used_bytes", "Live spill bytes on the local tier")?,
            disk_remote_used_bytes: int_gauge("store_disk_remote_used_bytes", "Live spill bytes on the remote tier")?,
            host_positions: int_gauge("store_host_positions", "Positions resident in host memory")?,
            disk_positions: int_gauge("store_disk_positions", "Positions spilled to disk")?,
            absent_positions: int_gauge("store_absent_positions", "Holes below the layer lengths")?,
            spilled_total: int_gauge("store_spilled_total", "Positions written to disk since creation")?,
            loaded_total: int_gauge("store_loaded_total", "Positions loaded back from disk since creation")?,
            forward_calls: int_gauge("attention_forward_calls", "Forward passes completed")?,
            chunks_processed: int_gauge("attention_chunks_processed", "Chunks folded")?,
            bytes_transferred: int_gauge("attention_bytes_transferred", "Host to device bytes")?,
            transfer_time_ms: gauge("attention_transfer_time_ms", "Transfer stream time")?,
            compute_time_ms: gauge("attention_compute_time_ms", "Compute stream time")?,
            registry,
        })
    }

    pub fn observe_store(&self, stats: &StoreStats) {
        self.host_used_bytes.set(stats.host_used_bytes as i64);
        self.host_budget_bytes.set(stats.host_budget_bytes as i64);
        self.disk_local_used_bytes.set(stats.disk_local_used_bytes as i64);
        self.disk_remote_used_bytes.set(stats.disk_remote_used_bytes as i64);
        self.host_positions.set(stats.host_positions as i64);
        self.disk_positions.set(stats.disk_positions as i64);
        self.absent_positions.set(stats.absent_positions as i64);
        self.spilled_total.set(stats.spilled_total as i64);
        self.loaded_total.set(stats.loaded_total as i64);
    }

    pub fn observe_attention(&self, stats: &AttentionStats) {
        self.forward_calls.set(stats.forward_calls as i64);
        self.chunks_processed.set(stats.chunks_processed as i64);
        self.bytes_transferred.set(stats.bytes_transferred as i64);
        self.transfer_time_ms.set(stats.transfer_time_ms);
        self.compute_time_ms.set(stats.compute_time_ms);
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
