//! Database configuration.
//!
//! Written to `voltdb_config.json` in the data directory. Every section
//! carries `#[serde(default)]` so older files with missing keys still load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codebook::CODEBOOK_CAPACITY;
use crate::error::Result;
use crate::resource;

pub const CONFIG_FILE: &str = "voltdb_config.json";
pub const DEFAULT_CODEBOOK_FILE: &str = "codebook.bin";

const MIB: u64 = 1024 * 1024;

// ── Tiers ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub fast_bytes: u64,
    pub medium_bytes: u64,
    pub slow_bytes: u64,
    /// Occupancy fraction at which eviction starts (default: 0.80)
    pub eviction_threshold: f64,
    pub ghost_capacity: usize,
    pub ghost_ttl_secs: u64,
    /// Idle time after which the recency factor of the eviction score halves.
    pub half_life_secs: f64,
    /// Summary vectors remembered for predictive prefetch.
    pub access_ring: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            fast_bytes: 16 * MIB,
            medium_bytes: 256 * MIB,
            slow_bytes: 64 * 256 * MIB,
            eviction_threshold: 0.80,
            ghost_capacity: 1000,
            ghost_ttl_secs: 3600,
            half_life_secs: 600.0,
            access_ring: 64,
        }
    }
}

// ── Garbage collector ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Frames referenced more often than this are immortal (default: 10)
    pub immortal_ref_threshold: u32,
    pub compress_below: f64,
    pub gist_below: f64,
    pub tombstone_below: f64,
    /// Age normaliser of the retention score, in days.
    pub age_scale_days: f64,
    /// Slow-tier entries evaluated per decay sweep.
    pub sweep_batch: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            immortal_ref_threshold: 10,
            compress_below: 0.7,
            gist_below: 0.4,
            tombstone_below: 0.1,
            age_scale_days: 30.0,
            sweep_batch: 256,
        }
    }
}

// ── Bleed engine ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleedConfig {
    pub enabled: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    pub tick_ms: u64,
    pub recall_timeout_ms: u64,
    /// Ticks without foreground traffic before the system counts as idle.
    pub idle_ticks: u32,
    /// Ghost similarity at which a vector recall loads the canonical frame.
    pub recall_similarity: f32,
    pub prefetch_batch: usize,
    pub consolidation_batch: usize,
    pub archive_batch: usize,
}

impl Default for BleedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            queue_capacity: 256,
            tick_ms: 100,
            recall_timeout_ms: 50,
            idle_ticks: 50,
            recall_similarity: 0.85,
            prefetch_batch: 8,
            consolidation_batch: 16,
            archive_batch: 64,
        }
    }
}

// ── Wisdom consolidation ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WisdomConfig {
    pub enabled: bool,
    /// Smallest cluster that earns a wisdom frame (default: 5)
    pub min_cluster_size: usize,
    /// Cosine similarity at which two frames join a cluster.
    pub similarity_threshold: f32,
    /// Certainty stamped on every wisdom slot.
    pub wisdom_gamma: f32,
    /// Neighbours examined per candidate.
    pub query_k: usize,
    /// Strands visited per bleed pass.
    pub strands_per_pass: usize,
}

impl Default for WisdomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cluster_size: 5,
            similarity_threshold: 0.85,
            wisdom_gamma: 0.95,
            query_k: 20,
            strands_per_pass: 4,
        }
    }
}

// ── Index set ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// HNSW neighbours per node above layer 0 (layer 0 keeps 2·m).
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Pending vectors that force a convergence on the next bleed tick.
    pub max_pending: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 100,
            ef_search: 64,
            max_pending: 1024,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Memtable size that triggers a flush (default: 4 MiB)
    pub memtable_bytes: usize,
    /// Run count that triggers compaction (default: 4)
    pub compaction_trigger: usize,
    pub max_conflict_retries: u32,
    /// fsync the WAL on every append.
    pub sync_wal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memtable_bytes: 4 * MIB as usize,
            compaction_trigger: 4,
            max_conflict_retries: 3,
            sync_wal: true,
        }
    }
}

// ── VoltConfig ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltConfig {
    /// Codebook blob. Relative paths resolve against the data directory.
    pub codebook_path: PathBuf,
    /// Entry count the codebook must have; `None` accepts any size.
    pub codebook_entries: Option<usize>,
    pub tiers: TierConfig,
    pub gc: GcConfig,
    pub bleed: BleedConfig,
    pub wisdom: WisdomConfig,
    pub index: IndexConfig,
    pub storage: StorageConfig,
}

impl Default for VoltConfig {
    fn default() -> Self {
        Self {
            codebook_path: PathBuf::from(DEFAULT_CODEBOOK_FILE),
            codebook_entries: Some(CODEBOOK_CAPACITY),
            tiers: TierConfig::default(),
            gc: GcConfig::default(),
            bleed: BleedConfig::default(),
            wisdom: WisdomConfig::default(),
            index: IndexConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl VoltConfig {
    /// Read config from the data directory. Returns None if absent.
    pub fn read_from(data_dir: &Path) -> Result<Option<Self>> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn write_to(&self, data_dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Defaults with tier capacities and worker count sized for this
    /// machine, or the persisted config if `data_dir` has one.
    pub fn auto_tuned(data_dir: &Path) -> Result<Self> {
        if let Some(config) = Self::read_from(data_dir)? {
            return Ok(config);
        }
        let sizing = resource::auto_size();
        let mut config = Self::default();
        config.tiers.fast_bytes = sizing.fast_bytes;
        config.tiers.medium_bytes = sizing.medium_bytes;
        config.tiers.slow_bytes = sizing.slow_bytes;
        config.bleed.workers = sizing.bleed_workers;
        Ok(config)
    }

    pub fn resolved_codebook_path(&self, data_dir: &Path) -> PathBuf {
        if self.codebook_path.is_absolute() {
            self.codebook_path.clone()
        } else {
            data_dir.join(&self.codebook_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = VoltConfig::default();
        assert_eq!(config.tiers.eviction_threshold, 0.80);
        assert_eq!(config.tiers.ghost_capacity, 1000);
        assert_eq!(config.index.m, 16);
        assert_eq!(config.index.ef_construction, 100);
        assert_eq!(config.index.ef_search, 64);
        assert_eq!(config.storage.memtable_bytes, 4 * 1024 * 1024);
        assert_eq!(config.storage.compaction_trigger, 4);
        assert_eq!(config.bleed.recall_timeout_ms, 50);
        assert_eq!(config.bleed.tick_ms, 100);
        assert_eq!(config.bleed.recall_similarity, 0.85);
        assert_eq!(config.gc.immortal_ref_threshold, 10);
        assert_eq!(config.wisdom.min_cluster_size, 5);
        assert_eq!(config.wisdom.similarity_threshold, 0.85);
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let mut config = VoltConfig::default();
        config.tiers.fast_bytes = 1234;
        config.bleed.enabled = false;
        config.write_to(dir.path()).unwrap();
        assert_eq!(VoltConfig::read_from(dir.path()).unwrap(), Some(config));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "tiers": { "fast_bytes": 4096 }, "bleed": { "enabled": false } }"#,
        )
        .unwrap();
        let config = VoltConfig::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(config.tiers.fast_bytes, 4096);
        assert_eq!(config.tiers.eviction_threshold, 0.80);
        assert!(!config.bleed.enabled);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_auto_tuned_orders_tiers() {
        let dir = TempDir::new().unwrap();
        let config = VoltConfig::auto_tuned(dir.path()).unwrap();
        assert!(config.tiers.fast_bytes < config.tiers.medium_bytes);
        assert!(config.tiers.medium_bytes < config.tiers.slow_bytes);
        assert!((1..=4).contains(&config.bleed.workers));
    }

    #[test]
    fn test_codebook_path_resolution() {
        let config = VoltConfig::default();
        let dir = Path::new("/data/volt");
        assert_eq!(config.resolved_codebook_path(dir), dir.join("codebook.bin"));
        let abs = VoltConfig {
            codebook_path: PathBuf::from("/opt/cb.bin"),
            ..Default::default()
        };
        assert_eq!(abs.resolved_codebook_path(dir), PathBuf::from("/opt/cb.bin"));
    }
}
