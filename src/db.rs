//! `VoltDb`: the engine facade.
//!
//! Owns the shared codebook, the storage engine, the index set, the
//! garbage collector, the tier manager and the bleed engine, and exposes
//! `store`, `recall` and `status` to callers.
//!
//! Startup order matters: the codebook is loaded and checked before any
//! directory is created or WAL opened, so a bad codebook leaves the data
//! directory untouched.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bleed::{BleedEngine, BleedStats, CycleReport};
use crate::codebook::Codebook;
use crate::config::{TierConfig, VoltConfig};
use crate::error::{Result, VoltError};
use crate::frame::{l2_normalize, strand_id, Entry, Frame, FrameId, StrandId, SLOT_DIM};
use crate::gc::{GarbageCollector, GcCountsSnapshot};
use crate::index::{IndexSet, IndexStats};
use crate::metrics::{Metrics, MetricsSnapshot, Op};
use crate::registry::CapabilityRegistry;
use crate::storage::run::RunMeta;
use crate::storage::{RecoveryStats, StorageEngine, StorageStats};
use crate::tier::{Tier, TierManager, TierStats};
use crate::wisdom::{WisdomEngine, WisdomReport, WisdomStats};

/// Typical frame size used to size the per-tier filters.
const TYPICAL_FRAME_BYTES: u64 = 4 * 1024;
const MAX_FILTER_FRAMES: u64 = 1 << 22;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Query {
    /// Nearest frames to a 256-dim vector by summary cosine similarity.
    Vector(Vec<f32>),
    /// Frames of a strand, newest first.
    Strand(String),
    /// Frames created within `[start, end]` microseconds, oldest first.
    TimeRange { start: u64, end: u64 },
    Concept(String),
    /// [`Query::Vector`] over the frames of one strand.
    StrandVector { strand: String, vector: Vec<f32> },
}

#[derive(Debug, Clone)]
pub struct RecallHit {
    pub entry: Arc<Entry>,
    pub score: f32,
    /// Tier the frame was found in before any promotion.
    pub tier: Tier,
    /// Built from a ghost because the canonical load timed out.
    pub ghost_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecallResult {
    pub hits: Vec<RecallHit>,
    /// Set when an on-demand recall timed out and ghost data was returned.
    pub low_confidence: bool,
}

impl RecallResult {
    pub fn ids(&self) -> Vec<FrameId> {
        self.hits.iter().map(|h| h.entry.id()).collect()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.hits.iter().any(|h| h.entry.id() == id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub tiers: TierStats,
    pub gc: GcCountsSnapshot,
    pub ghosts: usize,
    pub index: IndexStats,
    pub bleed: BleedStats,
    pub wisdom: WisdomStats,
    pub storage: StorageStats,
    pub recovery: RecoveryStats,
    pub frames_recovered: usize,
    pub metrics: MetricsSnapshot,
    pub capabilities: Vec<String>,
}

pub struct VoltDb {
    data_dir: PathBuf,
    config: VoltConfig,
    codebook: Arc<Codebook>,
    storage: Arc<StorageEngine>,
    index: Arc<IndexSet>,
    gc: Arc<GarbageCollector>,
    tiers: Arc<TierManager>,
    wisdom: Arc<WisdomEngine>,
    bleed: BleedEngine,
    registry: CapabilityRegistry,
    metrics: Arc<Metrics>,
    frames_recovered: usize,
    closed: AtomicBool,
}

fn filter_capacities(tiers: &TierConfig) -> [usize; 3] {
    [tiers.fast_bytes, tiers.medium_bytes, tiers.slow_bytes]
        .map(|bytes| (bytes / TYPICAL_FRAME_BYTES).clamp(1, MAX_FILTER_FRAMES) as usize)
}

impl VoltDb {
    /// Open (or create) an engine rooted at `data_dir`.
    ///
    /// Fails with `VoltError::Codebook` before touching the directory if
    /// the codebook is missing, damaged, or the wrong size.
    pub fn open(data_dir: impl AsRef<Path>, config: VoltConfig) -> Result<Self> {
        let started = Instant::now();
        let data_dir = data_dir.as_ref().to_path_buf();

        let codebook_path = config.resolved_codebook_path(&data_dir);
        let codebook = Codebook::load(&codebook_path)?;
        if let Some(expected) = config.codebook_entries {
            if codebook.len() != expected {
                return Err(VoltError::Codebook(format!(
                    "{} has {} entries, expected {expected}",
                    codebook_path.display(),
                    codebook.len()
                )));
            }
        }
        let codebook = Arc::new(codebook);

        fs::create_dir_all(&data_dir)?;
        let storage = Arc::new(StorageEngine::open(&data_dir, config.storage.clone())?);
        let metrics = Arc::new(Metrics::new());
        let index = Arc::new(IndexSet::new(&config.index, filter_capacities(&config.tiers)));
        let gc = Arc::new(GarbageCollector::new(config.gc.clone()));
        let tiers = Arc::new(TierManager::new(
            config.tiers.clone(),
            Arc::clone(&storage),
            Arc::clone(&index),
            Arc::clone(&gc),
            Arc::clone(&metrics),
        ));

        let recovered = storage.scan_latest()?;
        let frames_recovered = recovered.len();
        let mut slow = 0usize;
        for entry in recovered {
            if tiers.admit_recovered(entry)? == Tier::Slow {
                slow += 1;
            }
        }
        index.converge();

        let wisdom = Arc::new(WisdomEngine::new(
            config.wisdom.clone(),
            Arc::clone(&codebook),
            Arc::clone(&storage),
            Arc::clone(&index),
            Arc::clone(&tiers),
        ));
        let bleed = BleedEngine::new(
            config.bleed.clone(),
            config.gc.sweep_batch,
            Arc::clone(&tiers),
            Arc::clone(&index),
            Arc::clone(&storage),
            Arc::clone(&metrics),
            Some(Arc::clone(&wisdom)),
        );
        bleed.start()?;

        info!(
            path = %data_dir.display(),
            frames = frames_recovered,
            slow,
            wal_records = storage.recovery().records_replayed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine opened"
        );
        Ok(Self {
            data_dir,
            config,
            codebook,
            storage,
            index,
            gc,
            tiers,
            wisdom,
            bleed,
            registry: CapabilityRegistry::with_builtins(),
            metrics,
            frames_recovered,
            closed: AtomicBool::new(false),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &VoltConfig {
        &self.config
    }

    pub fn codebook(&self) -> &Arc<Codebook> {
        &self.codebook
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn tiers(&self) -> &Arc<TierManager> {
        &self.tiers
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VoltError::ShuttingDown);
        }
        Ok(())
    }

    // ── Write path ─────────────────────────────────────────────────

    /// Durably store `frame` and return its id. An id of 0 is assigned
    /// by the engine; a known id stores a new version of that frame.
    pub fn store(&self, mut frame: Frame) -> Result<FrameId> {
        self.ensure_open()?;
        let started = Instant::now();
        frame.validate()?;
        if frame.id == 0 {
            frame.id = self.storage.allocate_frame_id();
        }
        frame.assign_codes(&self.codebook);
        let id = frame.id;
        let parent = frame.parent;
        let entry = Entry::Full(frame);

        self.storage.store(&entry)?;
        match self.tiers.place(entry.clone()) {
            Ok(_) => {}
            Err(VoltError::CapacityExceeded { tier, needed, .. }) => {
                warn!(frame = id, tier, needed, "no room after eviction, placing in slow tier");
                self.tiers.admit(Tier::Slow, entry)?;
            }
            Err(e) => return Err(e),
        }

        if let Some(parent) = parent.filter(|p| *p != id) {
            match self.storage.add_reference(parent) {
                Ok(_) => self.tiers.refresh(self.storage.read_latest(parent)?.0),
                Err(VoltError::NotFound(_)) => debug!(frame = id, parent, "parent frame not found"),
                Err(e) => return Err(e),
            }
        }

        self.bleed.note_activity();
        self.metrics.record(Op::Store, started.elapsed().as_millis() as u64);
        Ok(id)
    }

    pub fn pin(&self, id: FrameId) -> Result<()> {
        self.set_pinned(id, true)
    }

    pub fn unpin(&self, id: FrameId) -> Result<()> {
        self.set_pinned(id, false)
    }

    fn set_pinned(&self, id: FrameId, pinned: bool) -> Result<()> {
        self.ensure_open()?;
        let entry = self.storage.set_pinned(id, pinned)?;
        self.tiers.refresh(entry);
        Ok(())
    }

    /// Remove `id` from storage, every tier and every index.
    pub fn delete(&self, id: FrameId) -> Result<()> {
        self.ensure_open()?;
        self.tiers.remove(id)
    }

    // ── Read path ──────────────────────────────────────────────────

    /// Fetch one frame, promoting it into the fast tier on a miss.
    pub fn get(&self, id: FrameId) -> Result<RecallHit> {
        self.ensure_open()?;
        let started = Instant::now();
        self.bleed.note_activity();
        let (entry, tier) = self.tiers.fetch(id)?;
        self.metrics.record(Op::Get, started.elapsed().as_millis() as u64);
        Ok(RecallHit {
            entry,
            score: 1.0,
            tier,
            ghost_only: false,
        })
    }

    /// Up to `k` frames matching `query`, best first. Strand, time and
    /// concept hits score 1.0; vector hits score cosine similarity.
    /// Tombstones are never returned.
    pub fn recall(&self, query: &Query, k: usize) -> Result<RecallResult> {
        self.ensure_open()?;
        let started = Instant::now();
        self.bleed.note_activity();
        let result = match query {
            Query::Vector(vector) => self.recall_vector(vector, None, k)?,
            Query::StrandVector { strand, vector } => self.recall_vector(vector, Some(strand_id(strand)), k)?,
            Query::Strand(name) => self.collect(self.index.strand_frames(strand_id(name)), k)?,
            Query::TimeRange { start, end } => self.collect(self.index.time_range(*start, *end), k)?,
            Query::Concept(token) => self.collect(self.index.concept(token), k)?,
        };
        self.metrics.record(Op::Recall, started.elapsed().as_millis() as u64);
        Ok(result)
    }

    fn collect(&self, ids: Vec<FrameId>, k: usize) -> Result<RecallResult> {
        let mut hits = Vec::with_capacity(k.min(ids.len()));
        for id in ids {
            if hits.len() >= k {
                break;
            }
            match self.tiers.fetch(id) {
                Ok((entry, tier)) if !entry.is_tombstone() => hits.push(RecallHit {
                    entry,
                    score: 1.0,
                    tier,
                    ghost_only: false,
                }),
                Ok(_) | Err(VoltError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(RecallResult {
            hits,
            low_confidence: false,
        })
    }

    fn recall_vector(&self, vector: &[f32], strand: Option<StrandId>, k: usize) -> Result<RecallResult> {
        if vector.len() != SLOT_DIM {
            return Err(VoltError::InvalidFrame(format!(
                "query vector has {} dimensions, expected {SLOT_DIM}",
                vector.len()
            )));
        }
        let mut query = [0.0f32; SLOT_DIM];
        query.copy_from_slice(vector);
        if !l2_normalize(&mut query) {
            return Ok(RecallResult::default());
        }

        let mut result = RecallResult::default();
        let mut seen = HashSet::new();

        // Ghosts close enough to the query load their canonical frame.
        let ghosts = self.tiers.ghost_matches(&query, self.config.bleed.recall_similarity);
        for ghost in ghosts.into_iter().filter(|g| strand.map_or(true, |s| g.strand == s)) {
            if result.hits.len() >= k {
                break;
            }
            seen.insert(ghost.id);
            let tier = self.tiers.locate(ghost.id).unwrap_or(Tier::Slow);
            match self.bleed.recall(ghost.id) {
                Ok(entry) if !entry.is_tombstone() => result.hits.push(RecallHit {
                    entry,
                    score: ghost.similarity,
                    tier,
                    ghost_only: false,
                }),
                Ok(_) | Err(VoltError::NotFound(_)) => {}
                Err(VoltError::Timeout { .. }) => {
                    result.low_confidence = true;
                    result.hits.push(RecallHit {
                        entry: Arc::new(ghost.to_entry()),
                        score: ghost.similarity,
                        tier,
                        ghost_only: true,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let nearest = match strand {
            Some(strand) => self.index.nearest_in_strand(strand, &query, k),
            None => self.index.nearest(&query, k),
        };
        for (id, score) in nearest {
            if result.hits.len() >= k {
                break;
            }
            if !seen.insert(id) {
                continue;
            }
            match self.tiers.fetch(id) {
                Ok((entry, tier)) if !entry.is_tombstone() => result.hits.push(RecallHit {
                    entry,
                    score,
                    tier,
                    ghost_only: false,
                }),
                Ok(_) | Err(VoltError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        result.hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.id().cmp(&b.entry.id()))
        });
        result.hits.truncate(k);
        Ok(result)
    }

    // ── Maintenance ────────────────────────────────────────────────

    pub fn flush(&self) -> Result<Option<RunMeta>> {
        let started = Instant::now();
        let meta = self.storage.flush()?;
        if meta.is_some() {
            self.metrics.record(Op::Flush, started.elapsed().as_millis() as u64);
        }
        Ok(meta)
    }

    /// One synchronous bleed cycle.
    pub fn maintain(&self) -> Result<CycleReport> {
        self.ensure_open()?;
        self.bleed.run_cycle(false)
    }

    /// Distil clusters of similar frames in the named strand into wisdom
    /// frames.
    pub fn consolidate_strand(&self, strand: &str) -> Result<WisdomReport> {
        self.ensure_open()?;
        self.wisdom.consolidate_strand(strand_id(strand))
    }

    /// Hold background maintenance and queued recalls until
    /// [`resume_bleed`](Self::resume_bleed).
    pub fn pause_bleed(&self) {
        self.bleed.pause();
    }

    pub fn resume_bleed(&self) {
        self.bleed.resume();
    }

    pub fn status(&self) -> Status {
        let tiers = self.tiers.stats();
        Status {
            ghosts: tiers.ghosts,
            tiers,
            gc: self.gc.counts().snapshot(),
            index: self.index.stats(),
            bleed: self.bleed.stats(),
            wisdom: self.wisdom.stats(),
            storage: self.storage.stats(),
            recovery: self.storage.recovery().clone(),
            frames_recovered: self.frames_recovered,
            metrics: self.metrics.snapshot(),
            capabilities: self.registry.ids(),
        }
    }

    /// Stop background work and flush. Further calls fail with
    /// `ShuttingDown`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.bleed.shutdown();
        self.flush()?;
        info!(path = %self.data_dir.display(), "engine closed");
        Ok(())
    }
}

impl Drop for VoltDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BleedConfig;
    use tempfile::TempDir;

    fn config() -> VoltConfig {
        let mut config = VoltConfig {
            codebook_entries: None,
            bleed: BleedConfig {
                enabled: false,
                ..BleedConfig::default()
            },
            ..VoltConfig::default()
        };
        config.storage.sync_wal = false;
        config
    }

    fn open(dir: &Path) -> VoltDb {
        Codebook::generate(64, 7).unwrap().save(&dir.join("codebook.bin")).unwrap();
        VoltDb::open(dir, config()).unwrap()
    }

    fn frame(strand: &str, gamma: f32, axis: usize) -> Frame {
        let mut frame = Frame::new(strand);
        let mut v = [0.0f32; SLOT_DIM];
        v[axis] = 1.0;
        frame.fill_slot(0, gamma, &[(0, v), (1, v)]).unwrap();
        frame
    }

    #[test]
    fn test_missing_codebook_is_fatal_and_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let err = VoltDb::open(&data, config()).err().unwrap();
        assert!(err.is_fatal());
        assert!(!data.exists());
    }

    #[test]
    fn test_codebook_size_is_checked() {
        let dir = TempDir::new().unwrap();
        Codebook::generate(8, 1).unwrap().save(&dir.path().join("codebook.bin")).unwrap();
        let config = VoltConfig {
            codebook_entries: Some(16),
            ..config()
        };
        assert!(matches!(VoltDb::open(dir.path(), config), Err(VoltError::Codebook(_))));
    }

    #[test]
    fn test_store_assigns_ids_and_codes() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        let a = db.store(frame("s", 0.5, 1)).unwrap();
        let b = db.store(frame("s", 0.5, 2)).unwrap();
        assert!(b > a);
        let hit = db.get(a).unwrap();
        assert_eq!(hit.tier, Tier::Fast);
        let stored = hit.entry.as_frame().unwrap();
        let expected = db.codebook().quantize(&stored.slot(0).unwrap().levels[0].as_ref().unwrap().vector).0;
        assert_eq!(stored.slot(0).unwrap().levels[0].as_ref().unwrap().code, expected);
    }

    #[test]
    fn test_vector_query_dimension_checked() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        let err = db.recall(&Query::Vector(vec![1.0; 3]), 1).unwrap_err();
        assert!(matches!(err, VoltError::InvalidFrame(_)));
        assert_eq!(db.status().storage.epoch, 0);
    }

    #[test]
    fn test_parent_gains_reference() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        let parent = db.store(frame("chain", 0.5, 1)).unwrap();
        let mut child = frame("chain", 0.5, 2);
        child.parent = Some(parent);
        db.store(child).unwrap();
        assert_eq!(db.get(parent).unwrap().entry.ref_count(), 1);
    }

    #[test]
    fn test_concept_and_time_queries() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        let mut f = frame("notes", 0.7, 3);
        f.concepts = vec!["Entropy".to_string()];
        f.created_at = 1_000;
        let id = db.store(f).unwrap();
        assert_eq!(db.recall(&Query::Concept("entropy".into()), 5).unwrap().ids(), vec![id]);
        assert_eq!(
            db.recall(&Query::TimeRange { start: 0, end: 2_000 }, 5).unwrap().ids(),
            vec![id]
        );
        assert!(db.recall(&Query::TimeRange { start: 2_000, end: 0 }, 5).unwrap().hits.is_empty());
    }

    #[test]
    fn test_pin_unpin_delete() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        let id = db.store(frame("p", 0.2, 4)).unwrap();
        db.pin(id).unwrap();
        assert!(db.get(id).unwrap().entry.pinned());
        db.unpin(id).unwrap();
        assert!(!db.get(id).unwrap().entry.pinned());
        db.delete(id).unwrap();
        assert!(matches!(db.get(id), Err(VoltError::NotFound(_))));
        assert!(db.recall(&Query::Strand("p".into()), 5).unwrap().hits.is_empty());
    }

    #[test]
    fn test_status_reports_everything() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        db.store(frame("s", 0.9, 5)).unwrap();
        let status = db.status();
        assert_eq!(status.gc.full, 1);
        assert_eq!(status.tiers.tier(Tier::Fast).unwrap().frames, 1);
        assert_eq!(status.metrics.count(Op::Store), 1);
        assert!(status.capabilities.contains(&"math-strand".to_string()));
        let json = serde_json::to_value(&status).unwrap();
        assert!(json["tiers"]["tiers"].is_array());
    }

    #[test]
    fn test_closed_engine_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path());
        db.close().unwrap();
        assert!(matches!(db.store(frame("s", 0.5, 1)), Err(VoltError::ShuttingDown)));
        db.close().unwrap();
    }
}
