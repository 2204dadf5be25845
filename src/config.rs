//! Runtime configuration for kv-tier-attn.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Store sizing, disk tiers, spill tuning and attention geometry live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dtype::DType;
use crate::error::ErrorClass;

/// Hard cap on the number of layers a store addresses.
pub const MAX_LAYERS: usize = 128;

/// Initial capacity (positions) of a layer's host window.
pub const MIN_LAYER_CAPACITY: usize = 256;

/// Upper bound for `max_positions`: positions are addressed as `i32`
/// across the status-code boundary.
pub const MAX_POSITIONS: usize = i32::MAX as usize;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("num_layers must be in 1..={max}, got {got}")]
    LayerCount { got: usize, max: usize },

    #[error("{field} must be non-zero")]
    ZeroDimension { field: &'static str },

    #[error("elem_bytes must be 2 (f16) or 4 (f32), got {0}")]
    ElemBytes(usize),

    #[error("zstd level must be in 1..=22, got {0}")]
    ZstdLevel(i32),

    #[error("max_positions must be in 1..={max}, got {got}")]
    MaxPositions { got: usize, max: usize },

    #[error("Failed to prepare directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Config
    }

    pub fn status(&self) -> i32 {
        self.class().status()
    }
}

/// Command-line arguments for the demo driver.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-tier-attn", about = "Tiered KV store + paged attention demo driver")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Positions to append per layer.
    #[arg(short, long, default_value_t = 4096)]
    pub positions: usize,

    /// Query rows per forward call.
    #[arg(long, default_value_t = 1)]
    pub batch: usize,

    /// Query heads per forward call (multiple of the KV head count).
    #[arg(long)]
    pub q_heads: Option<usize>,

    /// Print the prometheus exposition after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tiered KV store configuration.
    pub store: StoreConfig,

    /// Paged attention engine configuration.
    pub attention: AttentionConfig,

    /// Emulated accelerator configuration.
    pub device: DeviceConfig,
}

/// How the store serializes concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockingStrategy {
    /// One mutex around every operation.
    #[default]
    Global,
    /// One mutex per layer; only the budget ledger and spill files are shared.
    PerLayer,
}

/// Tiered KV store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of transformer layers.
    pub num_layers: usize,

    /// Number of KV heads per position.
    pub num_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Element width in bytes: 2 for f16, 4 for f32.
    pub elem_bytes: usize,

    /// Host (pinned) memory budget in bytes for K and V across all layers.
    pub host_budget_bytes: u64,

    /// Fast spill tier directory (None disables it).
    pub local_disk_path: Option<PathBuf>,

    /// Maximum live spill bytes on the local tier.
    pub local_disk_budget: u64,

    /// Overflow spill tier directory, e.g. NFS (None disables it).
    pub remote_disk_path: Option<PathBuf>,

    /// Maximum live spill bytes on the remote tier.
    pub remote_disk_budget: u64,

    /// Positions per layer are addressed in `0..max_positions`.
    pub max_positions: usize,

    /// Locking strategy.
    pub locking: LockingStrategy,

    /// Spill tuning.
    pub eviction: EvictionConfig,

    /// Spill compression.
    pub compression: CompressionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            num_layers: 32,
            num_kv_heads: 8,
            head_dim: 128,
            elem_bytes: 2,
            host_budget_bytes: 8 * 1024 * 1024 * 1024, // 8 GB
            local_disk_path: Some(PathBuf::from("/tmp/kv-tier-attn")),
            local_disk_budget: 20 * 1024 * 1024 * 1024, // 20 GB
            remote_disk_path: None,
            remote_disk_budget: 0,
            max_positions: 1 << 24,
            locking: LockingStrategy::default(),
            eviction: EvictionConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Bytes of one position of K (or of V) for one layer.
    pub fn row_bytes(&self) -> usize {
        self.num_kv_heads * self.head_dim * self.elem_bytes
    }

    /// Host budget share of a single layer.
    pub fn layer_budget_bytes(&self) -> u64 {
        self.host_budget_bytes / self.num_layers.max(1) as u64
    }

    /// Positions a single layer can hold in host memory.
    pub fn positions_per_layer(&self) -> usize {
        let per_pos = (self.row_bytes() * 2) as u64;
        if per_pos == 0 {
            return 0;
        }
        (self.layer_budget_bytes() / per_pos) as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_layers == 0 || self.num_layers > MAX_LAYERS {
            return Err(ConfigError::LayerCount {
                got: self.num_layers,
                max: MAX_LAYERS,
            });
        }
        if self.num_kv_heads == 0 {
            return Err(ConfigError::ZeroDimension { field: "num_kv_heads" });
        }
        if self.head_dim == 0 {
            return Err(ConfigError::ZeroDimension { field: "head_dim" });
        }
        if DType::from_elem_bytes(self.elem_bytes).is_none() {
            return Err(ConfigError::ElemBytes(self.elem_bytes));
        }
        if self.host_budget_bytes == 0 {
            return Err(ConfigError::ZeroDimension {
                field: "host_budget_bytes",
            });
        }
        if self.max_positions == 0 || self.max_positions > MAX_POSITIONS {
            return Err(ConfigError::MaxPositions {
                got: self.max_positions,
                max: MAX_POSITIONS,
            });
        }
        if self.compression.enabled && !(1..=22).contains(&self.compression.zstd_level) {
            return Err(ConfigError::ZstdLevel(self.compression.zstd_level));
        }
        Ok(())
    }
}

/// Spill tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Minimum number of positions spilled each time a layer's host window
    /// has to slide forward. Clamped to the window capacity.
    pub spill_batch: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self { spill_batch: 64 }
    }
}

/// Compression applied to spilled rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to disk.
    pub enabled: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            zstd_level: 3,
        }
    }
}

/// Paged attention engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Number of KV heads.
    pub num_kv_heads: usize,

    /// Head dimension (K and V).
    pub head_dim: usize,

    /// Positions per chunk (0 = auto-select).
    pub chunk_size: usize,

    /// K/V/Q/output dtype.
    pub dtype: DType,

    /// Device ordinal.
    pub device: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_kv_heads: 8,
            head_dim: 128,
            chunk_size: 0,
            dtype: DType::F16,
            device: 0,
        }
    }
}

impl AttentionConfig {
    /// Bytes of one position of K (or V).
    pub fn row_bytes(&self) -> usize {
        self.num_kv_heads * self.head_dim * self.dtype.size()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_kv_heads == 0 {
            return Err(ConfigError::ZeroDimension { field: "num_kv_heads" });
        }
        if self.head_dim == 0 {
            return Err(ConfigError::ZeroDimension { field: "head_dim" });
        }
        Ok(())
    }
}

/// Emulated accelerator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device memory available for chunk buffers, in bytes.
    pub memory_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Attention geometry matching the store's layout.
    pub fn attention_for_store(&self) -> AttentionConfig {
        AttentionConfig {
            num_kv_heads: self.store.num_kv_heads,
            head_dim: self.store.head_dim,
            dtype: DType::from_elem_bytes(self.store.elem_bytes).unwrap_or(DType::F16),
            ..self.attention.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.store.num_layers, 32);
        assert_eq!(cfg.store.eviction.spill_batch, 64);
        assert!(cfg.store.validate().is_ok());
    }

    #[test]
    fn test_row_bytes() {
        let cfg = StoreConfig::default();
        // num_kv_heads(8) * head_dim(128) * 2(fp16)
        assert_eq!(cfg.row_bytes(), 8 * 128 * 2);
    }

    #[test]
    fn test_positions_per_layer() {
        let cfg = StoreConfig {
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 8,
            elem_bytes: 2,
            host_budget_bytes: 4096,
            ..Default::default()
        };
        // 2048 bytes per layer / (32 bytes * 2)
        assert_eq!(cfg.positions_per_layer(), 32);
    }

    #[test]
    fn test_validation_rejects_bad_dims() {
        let mut cfg = StoreConfig::default();
        cfg.num_layers = MAX_LAYERS + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::LayerCount { .. })));

        let mut cfg = StoreConfig::default();
        cfg.elem_bytes = 3;
        assert!(matches!(cfg.validate(), Err(ConfigError::ElemBytes(3))));

        let mut cfg = StoreConfig::default();
        cfg.head_dim = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = StoreConfig::default();
        cfg.max_positions = MAX_POSITIONS + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::MaxPositions { .. })));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"store": {"num_layers": 4, "locking": "per_layer"}}"#).unwrap();
        assert_eq!(cfg.store.num_layers, 4);
        assert_eq!(cfg.store.locking, LockingStrategy::PerLayer);
        assert_eq!(cfg.store.head_dim, 128);
        assert_eq!(cfg.attention.dtype, DType::F16);
    }
}
