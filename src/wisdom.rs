//! Wisdom consolidation: one high-certainty summary frame per cluster of
//! similar frames in a strand.
//!
//! Candidates are the full frames of a strand resident in fast or medium
//! that have no parent yet. Two candidates share a cluster when a
//! strand-scoped vector search from one finds the other at or above
//! `similarity_threshold`; clusters are the connected components. Each
//! cluster of at least `min_cluster_size` frames yields a wisdom frame
//! holding, per slot, the normalized mean of the members' coarsest vectors
//! at `wisdom_gamma`. Members are linked under it through their parent
//! field and its reference count counts them, so the collector never
//! tombstones it while they exist.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::codebook::Codebook;
use crate::config::WisdomConfig;
use crate::error::{Result, VoltError};
use crate::frame::{l2_normalize, now_micros, Entry, Frame, FrameId, StrandId, MAX_SLOTS, SLOT_DIM};
use crate::index::IndexSet;
use crate::storage::StorageEngine;
use crate::tier::{Tier, TierManager};

/// Concept token carried by every wisdom frame.
pub const WISDOM_CONCEPT: &str = "wisdom";

pub fn is_wisdom(entry: &Entry) -> bool {
    entry.concepts().iter().any(|c| c == WISDOM_CONCEPT)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Ascending.
    pub members: Vec<FrameId>,
    pub centroid: [f32; SLOT_DIM],
}

/// Union-find over candidate positions.
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Group `candidates` (id, summary vector) into clusters. `neighbours`
/// returns `(id, cosine similarity)` pairs for a query vector; ids outside
/// `candidates` are ignored. Clusters come back ordered by smallest member.
pub fn find_clusters<F>(candidates: &[(FrameId, [f32; SLOT_DIM])], config: &WisdomConfig, mut neighbours: F) -> Vec<Cluster>
where
    F: FnMut(&[f32; SLOT_DIM]) -> Vec<(FrameId, f32)>,
{
    let min_size = config.min_cluster_size.max(2);
    if candidates.len() < min_size {
        return Vec::new();
    }
    let position: HashMap<FrameId, usize> = candidates.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();
    let mut sets = DisjointSets::new(candidates.len());
    for (i, (id, vector)) in candidates.iter().enumerate() {
        for (other, similarity) in neighbours(vector) {
            if other == *id || similarity < config.similarity_threshold {
                continue;
            }
            if let Some(&j) = position.get(&other) {
                sets.union(i, j);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..candidates.len() {
        groups.entry(sets.find(i)).or_default().push(i);
    }
    let mut clusters: Vec<Cluster> = groups
        .into_values()
        .filter(|group| group.len() >= min_size)
        .filter_map(|group| {
            let mut centroid = [0.0f32; SLOT_DIM];
            for &i in &group {
                for (c, x) in centroid.iter_mut().zip(candidates[i].1.iter()) {
                    *c += x;
                }
            }
            if !l2_normalize(&mut centroid) {
                return None;
            }
            let mut members: Vec<FrameId> = group.iter().map(|&i| candidates[i].0).collect();
            members.sort_unstable();
            Some(Cluster { members, centroid })
        })
        .collect();
    clusters.sort_by_key(|c| c.members[0]);
    clusters
}

/// The wisdom frame for `sources`, id unassigned. `None` when no source
/// has a usable vector.
pub fn build_wisdom_frame(strand: StrandId, sources: &[&Frame], config: &WisdomConfig, now: u64) -> Result<Option<Frame>> {
    let mut sums: [Option<[f32; SLOT_DIM]>; MAX_SLOTS] = [None; MAX_SLOTS];
    for frame in sources {
        for (index, slot) in frame.filled_slots() {
            if let Some(payload) = slot.coarsest() {
                let sum = sums[index].get_or_insert([0.0f32; SLOT_DIM]);
                for (s, x) in sum.iter_mut().zip(payload.vector.iter()) {
                    *s += x;
                }
            }
        }
    }

    let mut wisdom = Frame::with_strand_id(strand);
    wisdom.created_at = now;
    let mut concepts: BTreeSet<String> = sources.iter().flat_map(|f| f.concepts.iter().cloned()).collect();
    concepts.insert(WISDOM_CONCEPT.to_string());
    wisdom.concepts = concepts.into_iter().collect();
    for (index, sum) in sums.iter().enumerate() {
        let Some(mut mean) = *sum else {
            continue;
        };
        if l2_normalize(&mut mean) {
            wisdom.fill_slot(index, config.wisdom_gamma, &[(0, mean)])?;
        }
    }
    Ok(if wisdom.is_empty() { None } else { Some(wisdom) })
}

// ── Engine ─────────────────────────────────────────────────────────

/// What one consolidation call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WisdomReport {
    pub strands: usize,
    pub clusters: usize,
    pub wisdom_frames: Vec<FrameId>,
    /// Source frames linked under a wisdom frame.
    pub linked: usize,
}

impl WisdomReport {
    fn absorb(&mut self, other: WisdomReport) {
        self.strands += other.strands;
        self.clusters += other.clusters;
        self.wisdom_frames.extend(other.wisdom_frames);
        self.linked += other.linked;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WisdomStats {
    pub passes: u64,
    pub wisdom_frames: u64,
    pub linked: u64,
}

pub struct WisdomEngine {
    config: WisdomConfig,
    codebook: Arc<Codebook>,
    storage: Arc<StorageEngine>,
    index: Arc<IndexSet>,
    tiers: Arc<TierManager>,
    /// Round-robin position over the routed strands.
    cursor: AtomicUsize,
    passes: AtomicU64,
    created: AtomicU64,
    linked: AtomicU64,
}

impl WisdomEngine {
    pub fn new(
        config: WisdomConfig,
        codebook: Arc<Codebook>,
        storage: Arc<StorageEngine>,
        index: Arc<IndexSet>,
        tiers: Arc<TierManager>,
    ) -> Self {
        Self {
            config,
            codebook,
            storage,
            index,
            tiers,
            cursor: AtomicUsize::new(0),
            passes: AtomicU64::new(0),
            created: AtomicU64::new(0),
            linked: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &WisdomConfig {
        &self.config
    }

    /// Consolidate the next `strands_per_pass` strands. No-op when disabled.
    pub fn consolidate(&self) -> Result<WisdomReport> {
        let mut report = WisdomReport::default();
        if !self.config.enabled {
            return Ok(report);
        }
        let strands = self.index.strands();
        if strands.is_empty() {
            return Ok(report);
        }
        let visits = self.config.strands_per_pass.clamp(1, strands.len());
        let start = self.cursor.fetch_add(visits, Ordering::Relaxed);
        for n in 0..visits {
            let strand = strands[(start + n) % strands.len()];
            report.absorb(self.consolidate_strand(strand)?);
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    /// Cluster the in-memory frames of `strand` and write one wisdom frame
    /// per qualifying cluster.
    pub fn consolidate_strand(&self, strand: StrandId) -> Result<WisdomReport> {
        let started = Instant::now();
        let mut report = WisdomReport {
            strands: 1,
            ..WisdomReport::default()
        };

        let mut sources: HashMap<FrameId, Arc<Entry>> = HashMap::new();
        let mut candidates: Vec<(FrameId, [f32; SLOT_DIM])> = Vec::new();
        for id in self.index.strand_frames(strand) {
            let Some((entry, _)) = self.tiers.peek(id) else {
                continue;
            };
            let Some(frame) = entry.as_frame() else {
                continue;
            };
            if frame.parent.is_some() || is_wisdom(&entry) {
                continue;
            }
            let Some(vector) = frame.summary_vector() else {
                continue;
            };
            candidates.push((id, vector));
            sources.insert(id, entry);
        }

        let clusters = find_clusters(&candidates, &self.config, |vector| {
            self.index.nearest_in_strand(strand, vector, self.config.query_k)
        });
        report.clusters = clusters.len();

        for cluster in clusters {
            let frames: Vec<&Frame> = cluster
                .members
                .iter()
                .filter_map(|id| sources.get(id))
                .filter_map(|entry| entry.as_frame())
                .collect();
            let Some(mut wisdom) = build_wisdom_frame(strand, &frames, &self.config, now_micros())? else {
                continue;
            };
            wisdom.id = self.storage.allocate_frame_id();
            wisdom.assign_codes(&self.codebook);
            let wisdom_id = wisdom.id;
            let entry = Entry::Full(wisdom);
            self.storage.store(&entry)?;
            self.place(entry)?;

            let linked = self.link(&cluster.members, wisdom_id)?;
            info!(
                strand,
                wisdom = wisdom_id,
                members = cluster.members.len(),
                linked,
                "wisdom frame created"
            );
            report.wisdom_frames.push(wisdom_id);
            report.linked += linked as usize;
        }

        if !report.wisdom_frames.is_empty() {
            self.created.fetch_add(report.wisdom_frames.len() as u64, Ordering::Relaxed);
            self.linked.fetch_add(report.linked as u64, Ordering::Relaxed);
        }
        debug!(
            strand,
            candidates = candidates.len(),
            clusters = report.clusters,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "strand consolidated"
        );
        Ok(report)
    }

    fn place(&self, entry: Entry) -> Result<()> {
        match self.tiers.place(entry.clone()) {
            Ok(_) => Ok(()),
            Err(VoltError::CapacityExceeded { .. }) => self.tiers.admit(Tier::Slow, entry),
            Err(e) => Err(e),
        }
    }

    /// Parent every still-unlinked member under `wisdom_id` and count them
    /// as its references.
    fn link(&self, members: &[FrameId], wisdom_id: FrameId) -> Result<u32> {
        let mut linked = 0u32;
        for &member in members {
            match self.storage.attach_parent(member, wisdom_id) {
                Ok(Some(updated)) => {
                    self.tiers.refresh(updated);
                    linked += 1;
                }
                Ok(None) | Err(VoltError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if linked > 0 {
            self.storage.add_references(wisdom_id, linked)?;
            self.tiers.refresh(self.storage.read_latest(wisdom_id)?.0);
        }
        Ok(linked)
    }

    pub fn stats(&self) -> WisdomStats {
        WisdomStats {
            passes: self.passes.load(Ordering::Relaxed),
            wisdom_frames: self.created.load(Ordering::Relaxed),
            linked: self.linked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, IndexConfig, StorageConfig, TierConfig};
    use crate::frame::{cosine_similarity, strand_id, DecayLevel};
    use crate::gc::GarbageCollector;
    use crate::metrics::Metrics;
    use tempfile::TempDir;

    /// Unit vector mostly along `axis` with a small per-id tilt.
    fn near_axis(axis: usize, id: FrameId) -> [f32; SLOT_DIM] {
        let mut v = [0.0f32; SLOT_DIM];
        v[axis] = 1.0;
        v[(axis + 1 + id as usize) % SLOT_DIM] = 0.1;
        l2_normalize(&mut v);
        v
    }

    fn config(min_cluster_size: usize) -> WisdomConfig {
        WisdomConfig {
            min_cluster_size,
            ..WisdomConfig::default()
        }
    }

    fn brute_force(candidates: &[(FrameId, [f32; SLOT_DIM])]) -> impl FnMut(&[f32; SLOT_DIM]) -> Vec<(FrameId, f32)> + '_ {
        move |q| candidates.iter().map(|(id, v)| (*id, cosine_similarity(q, v))).collect()
    }

    #[test]
    fn test_clusters_split_by_direction() {
        let mut candidates: Vec<(FrameId, [f32; SLOT_DIM])> = (1..=5).map(|id| (id, near_axis(0, id))).collect();
        candidates.extend((6..=8).map(|id| (id, near_axis(40, id))));
        candidates.push((9, near_axis(90, 9)));

        let clusters = find_clusters(&candidates, &config(3), brute_force(&candidates));
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![1, 2, 3, 4, 5]);
        assert_eq!(clusters[1].members, vec![6, 7, 8]);
        assert!(clusters[0].centroid[0] > 0.9);

        // the second group is below the default minimum of five
        let strict = find_clusters(&candidates, &WisdomConfig::default(), brute_force(&candidates));
        assert_eq!(strict.len(), 1);
    }

    #[test]
    fn test_too_few_candidates_make_no_cluster() {
        let candidates: Vec<(FrameId, [f32; SLOT_DIM])> = (1..=4).map(|id| (id, near_axis(3, id))).collect();
        assert!(find_clusters(&candidates, &WisdomConfig::default(), brute_force(&candidates)).is_empty());
        assert!(find_clusters(&[], &config(1), |_| Vec::new()).is_empty());
    }

    #[test]
    fn test_wisdom_frame_averages_coarsest_vectors() {
        let mut frames = Vec::new();
        for id in 1..=3u64 {
            let mut frame = Frame::new("w");
            frame.id = id;
            frame.concepts = vec![format!("c{id}")];
            frame.fill_slot(0, 0.4, &[(0, near_axis(0, id)), (2, near_axis(7, id))]).unwrap();
            if id == 2 {
                frame.fill_slot(5, 0.6, &[(1, near_axis(9, id))]).unwrap();
            }
            frames.push(frame);
        }
        let refs: Vec<&Frame> = frames.iter().collect();
        let wisdom = build_wisdom_frame(strand_id("w"), &refs, &WisdomConfig::default(), 77)
            .unwrap()
            .unwrap();

        assert_eq!(wisdom.id, 0);
        assert_eq!(wisdom.created_at, 77);
        assert_eq!(wisdom.strand, strand_id("w"));
        assert_eq!(wisdom.slot_mask(), 0b10_0001);
        assert!(wisdom.has_resolution(0, 0));
        assert!(!wisdom.has_resolution(0, 2));
        assert!(wisdom.has_resolution(5, 0));
        assert_eq!(wisdom.gamma(), Some(0.95));
        let mean = *wisdom.slot(0).unwrap().coarsest().unwrap().vector;
        assert!(cosine_similarity(&mean, &near_axis(0, 1)) > 0.98);
        assert_eq!(wisdom.concepts, vec!["c1", "c2", "c3", WISDOM_CONCEPT]);
    }

    struct Harness {
        _dir: TempDir,
        storage: Arc<StorageEngine>,
        index: Arc<IndexSet>,
        tiers: Arc<TierManager>,
        engine: WisdomEngine,
    }

    fn harness(config: WisdomConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            StorageEngine::open(
                dir.path(),
                StorageConfig {
                    sync_wal: false,
                    ..StorageConfig::default()
                },
            )
            .unwrap(),
        );
        let index = Arc::new(IndexSet::new(&IndexConfig::default(), [64, 64, 64]));
        let tiers = Arc::new(TierManager::new(
            TierConfig::default(),
            Arc::clone(&storage),
            Arc::clone(&index),
            Arc::new(GarbageCollector::new(GcConfig::default())),
            Arc::new(Metrics::new()),
        ));
        let codebook = Arc::new(Codebook::generate(16, 3).unwrap());
        let engine = WisdomEngine::new(config, codebook, Arc::clone(&storage), Arc::clone(&index), Arc::clone(&tiers));
        Harness {
            _dir: dir,
            storage,
            index,
            tiers,
            engine,
        }
    }

    impl Harness {
        fn put(&self, id: FrameId, strand: &str, axis: usize) {
            let mut frame = Frame::new(strand);
            frame.id = id;
            frame.fill_slot(0, 0.3, &[(0, near_axis(axis, id))]).unwrap();
            let entry = Entry::Full(frame);
            self.storage.store(&entry).unwrap();
            self.tiers.place(entry).unwrap();
        }
    }

    #[test]
    fn test_consolidation_links_cluster_under_wisdom_frame() {
        let h = harness(config(3));
        for id in 1..=4 {
            h.put(id, "notes", 0);
        }
        h.put(5, "notes", 120);
        // same direction, other strand
        for id in 6..=8 {
            h.put(id, "other", 0);
        }

        let report = h.engine.consolidate_strand(strand_id("notes")).unwrap();
        assert_eq!(report.clusters, 1);
        assert_eq!(report.linked, 4);
        let wisdom_id = report.wisdom_frames[0];
        assert!(wisdom_id > 8);

        let (wisdom, _) = h.storage.read_latest(wisdom_id).unwrap();
        assert!(is_wisdom(&wisdom));
        assert_eq!(wisdom.ref_count(), 4);
        assert_eq!(wisdom.gamma(), Some(0.95));
        assert_eq!(wisdom.strand(), strand_id("notes"));
        assert_eq!(h.tiers.locate(wisdom_id), Some(Tier::Fast));
        assert_eq!(h.index.strand_of(wisdom_id), Some(strand_id("notes")));

        for id in 1..=4 {
            assert_eq!(h.storage.read_latest(id).unwrap().0.parent(), Some(wisdom_id));
            assert_eq!(h.tiers.peek(id).unwrap().0.parent(), Some(wisdom_id));
        }
        assert_eq!(h.storage.read_latest(5).unwrap().0.parent(), None);
        assert_eq!(h.storage.read_latest(6).unwrap().0.parent(), None);
        assert_eq!(h.engine.stats().wisdom_frames, 1);

        // linked frames and the wisdom frame are not candidates again
        let again = h.engine.consolidate_strand(strand_id("notes")).unwrap();
        assert!(again.wisdom_frames.is_empty());
    }

    #[test]
    fn test_referenced_wisdom_frame_outlives_decay() {
        let h = harness(config(3));
        for id in 1..=3 {
            h.put(id, "decay", 5);
        }
        let report = h.engine.consolidate_strand(strand_id("decay")).unwrap();
        let (wisdom, _) = h.storage.read_latest(report.wisdom_frames[0]).unwrap();
        let gc = GarbageCollector::new(GcConfig {
            tombstone_below: 1.0,
            immortal_ref_threshold: 100,
            ..GcConfig::default()
        });
        assert!(gc.target_level(&wisdom, 0, u64::MAX / 2) >= DecayLevel::Gist);
    }

    #[test]
    fn test_pass_visits_strands_round_robin() {
        let h = harness(WisdomConfig {
            min_cluster_size: 2,
            strands_per_pass: 1,
            ..WisdomConfig::default()
        });
        for (id, strand) in [(1, "a"), (2, "a"), (3, "b"), (4, "b")] {
            h.put(id, strand, 11);
        }
        let first = h.engine.consolidate().unwrap();
        let second = h.engine.consolidate().unwrap();
        assert_eq!(first.strands + second.strands, 2);
        assert_eq!(first.wisdom_frames.len() + second.wisdom_frames.len(), 2);
        assert_eq!(h.engine.stats().passes, 2);

        let disabled = harness(WisdomConfig {
            enabled: false,
            ..WisdomConfig::default()
        });
        disabled.put(1, "a", 0);
        assert_eq!(disabled.engine.consolidate().unwrap(), WisdomReport::default());
    }
}
