//! Index Set: five in-memory structures over the committed record stream.
//!
//! - `routing`: strand id → partition handle
//! - `semantic`: HNSW over summary vectors (pending buffer + published graph)
//! - `temporal`: timestamp-ordered keys
//! - `concept`: concept token postings
//! - `filter`: per-tier negative filters
//!
//! Rebuilt from storage on open; never persisted. `on_write` updates every
//! structure before the write is acknowledged. The semantic graph itself
//! catches up on `converge()`, but its pending buffer keeps new vectors
//! searchable in the meantime.

pub mod concept;
pub mod filter;
pub mod routing;
pub mod semantic;
pub mod temporal;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::IndexConfig;
use crate::frame::{Entry, FrameId, StrandId, SLOT_DIM};
use crate::tier::Tier;

pub use filter::{FilterStats, TierFilter, TierFilters};
pub use routing::PartitionHandle;
pub use semantic::{HnswParams, SemanticStats};

use concept::ConceptIndex;
use routing::StrandRouting;
use semantic::SemanticIndex;
use temporal::TemporalIndex;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub strands: usize,
    pub routed_frames: usize,
    pub temporal_keys: usize,
    pub concept_tokens: usize,
    pub semantic: SemanticStats,
    pub filters: Vec<(Tier, FilterStats)>,
}

/// Initial candidate multiplier of a strand-scoped vector search.
const STRAND_OVERFETCH: usize = 4;

pub struct IndexSet {
    routing: RwLock<StrandRouting>,
    semantic: SemanticIndex,
    temporal: RwLock<TemporalIndex>,
    concepts: RwLock<ConceptIndex>,
    filters: RwLock<TierFilters>,
}

impl IndexSet {
    /// `filter_capacities` are the expected resident frame counts per tier.
    pub fn new(config: &IndexConfig, filter_capacities: [usize; 3]) -> Self {
        Self {
            routing: RwLock::new(StrandRouting::new()),
            semantic: SemanticIndex::new(HnswParams::from(config)),
            temporal: RwLock::new(TemporalIndex::new()),
            concepts: RwLock::new(ConceptIndex::new()),
            filters: RwLock::new(TierFilters::new(filter_capacities)),
        }
    }

    // ── Mutators ───────────────────────────────────────────────────

    /// Index a committed entry resident in `tier`. Callers hold the tier's
    /// resident-set lock so the filter insert precedes residency.
    pub fn on_write(&self, entry: &Entry, tier: Tier) {
        let id = entry.id();
        self.filters.write().get_mut(tier).insert(id);
        self.routing.write().insert(entry.strand(), id, entry.created_at());
        self.temporal.write().insert(entry.created_at(), id);
        if entry.is_tombstone() {
            self.concepts.write().remove(id);
            self.semantic.remove(id);
            return;
        }
        self.concepts.write().set(id, entry.concepts());
        match entry.summary_vector() {
            Some(v) => self.semantic.insert(id, &v),
            None => self.semantic.remove(id),
        }
    }

    /// Forget `id` entirely; `tier` is where it was resident, if anywhere.
    pub fn on_remove(&self, id: FrameId, tier: Option<Tier>) {
        if let Some(tier) = tier {
            self.filters.write().get_mut(tier).note_removed();
        }
        self.routing.write().remove(id);
        self.temporal.write().remove(id);
        self.concepts.write().remove(id);
        self.semantic.remove(id);
    }

    /// Residency change. Safe to call before the move: the destination
    /// filter gains the id first and the source filter only counts it.
    pub fn on_move(&self, id: FrameId, from: Tier, to: Tier) {
        let mut filters = self.filters.write();
        filters.get_mut(to).insert(id);
        filters.get_mut(from).note_removed();
    }

    /// Fold the semantic pending buffer into the published graph.
    pub fn converge(&self) -> usize {
        self.semantic.converge()
    }

    pub fn pending_semantic(&self) -> usize {
        self.semantic.pending_len()
    }

    pub fn filter_needs_rebuild(&self, tier: Tier) -> bool {
        self.filters.read().get(tier).needs_rebuild()
    }

    /// Replace `tier`'s filter. Callers hold the tier's resident-set lock.
    pub fn rebuild_filter(&self, tier: Tier, resident: &[FrameId]) {
        self.filters.write().get_mut(tier).rebuild(resident);
    }

    // ── Queries ────────────────────────────────────────────────────

    /// `false` means `id` is definitely not resident in `tier`.
    pub fn may_contain(&self, tier: Tier, id: FrameId) -> bool {
        self.filters.read().get(tier).maybe_contains(id)
    }

    pub fn partition(&self, strand: StrandId) -> Option<PartitionHandle> {
        self.routing.read().partition(strand).cloned()
    }

    /// Frames of `strand`, newest first.
    pub fn strand_frames(&self, strand: StrandId) -> Vec<FrameId> {
        let ids: Vec<FrameId> = match self.routing.read().partition(strand) {
            Some(handle) => handle.frames.iter().copied().collect(),
            None => return Vec::new(),
        };
        let temporal = self.temporal.read();
        let mut keyed: Vec<(u64, FrameId)> = ids
            .into_iter()
            .map(|id| (temporal.timestamp_of(id).unwrap_or(0), id))
            .collect();
        keyed.sort_unstable_by(|a, b| b.cmp(a));
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    pub fn strand_of(&self, id: FrameId) -> Option<StrandId> {
        self.routing.read().strand_of(id)
    }

    pub fn strands(&self) -> Vec<StrandId> {
        self.routing.read().strands()
    }

    /// Top `k` frames by cosine similarity of their summary vectors.
    pub fn nearest(&self, query: &[f32; SLOT_DIM], k: usize) -> Vec<(FrameId, f32)> {
        self.semantic.search(query, k)
    }

    /// [`nearest`](Self::nearest) restricted to the frames of `strand`.
    /// The shared graph is searched with a widening candidate count until
    /// `k` strand members turn up or the graph runs out.
    pub fn nearest_in_strand(&self, strand: StrandId, query: &[f32; SLOT_DIM], k: usize) -> Vec<(FrameId, f32)> {
        if k == 0 || self.routing.read().partition(strand).is_none() {
            return Vec::new();
        }
        let mut fetch = k.saturating_mul(STRAND_OVERFETCH);
        loop {
            let hits = self.semantic.search(query, fetch);
            let exhausted = hits.len() < fetch;
            let routing = self.routing.read();
            let members: Vec<(FrameId, f32)> = hits
                .into_iter()
                .filter(|(id, _)| routing.strand_of(*id) == Some(strand))
                .take(k)
                .collect();
            if members.len() >= k || exhausted {
                return members;
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Frames created within `[start, end]`, oldest first.
    pub fn time_range(&self, start: u64, end: u64) -> Vec<FrameId> {
        self.temporal.read().range(start, end)
    }

    pub fn most_recent(&self, n: usize) -> Vec<FrameId> {
        self.temporal.read().most_recent(n)
    }

    pub fn concept(&self, token: &str) -> Vec<FrameId> {
        self.concepts.read().lookup(token)
    }

    pub fn stats(&self) -> IndexStats {
        let routing = self.routing.read();
        let filters = self.filters.read();
        IndexStats {
            strands: routing.strand_count(),
            routed_frames: routing.frame_count(),
            temporal_keys: self.temporal.read().len(),
            concept_tokens: self.concepts.read().token_count(),
            semantic: self.semantic.stats(),
            filters: Tier::ALL.iter().map(|t| (*t, filters.get(*t).stats())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{strand_id, DecayLevel, Frame, SLOT_DIM};

    fn entry(id: FrameId, strand: &str, created_at: u64, concepts: &[&str]) -> Entry {
        let mut frame = Frame::new(strand);
        frame.id = id;
        frame.created_at = created_at;
        frame.concepts = concepts.iter().map(|s| s.to_string()).collect();
        let mut v = [0.0f32; SLOT_DIM];
        v[id as usize % SLOT_DIM] = 1.0;
        frame.fill_slot(0, 0.9, &[(0, v)]).unwrap();
        Entry::Full(frame)
    }

    fn index() -> IndexSet {
        IndexSet::new(&IndexConfig::default(), [64, 64, 64])
    }

    #[test]
    fn test_on_write_updates_every_structure() {
        let idx = index();
        idx.on_write(&entry(1, "math", 100, &["Algebra"]), Tier::Fast);

        assert_eq!(idx.strand_frames(strand_id("math")), vec![1]);
        assert_eq!(idx.time_range(100, 100), vec![1]);
        assert_eq!(idx.concept("algebra"), vec![1]);
        assert!(idx.may_contain(Tier::Fast, 1));
        let mut q = [0.0f32; SLOT_DIM];
        q[1] = 1.0;
        assert_eq!(idx.nearest(&q, 1)[0].0, 1);
        assert_eq!(idx.partition(strand_id("math")).unwrap().newest_at, 100);
    }

    #[test]
    fn test_strand_frames_newest_first() {
        let idx = index();
        idx.on_write(&entry(1, "s", 10, &[]), Tier::Fast);
        idx.on_write(&entry(2, "s", 30, &[]), Tier::Fast);
        idx.on_write(&entry(3, "s", 20, &[]), Tier::Fast);
        assert_eq!(idx.strand_frames(strand_id("s")), vec![2, 3, 1]);
        assert!(idx.strand_frames(strand_id("other")).is_empty());
    }

    #[test]
    fn test_tombstone_leaves_semantic_and_concepts() {
        let idx = index();
        let e = entry(5, "s", 10, &["x"]);
        idx.on_write(&e, Tier::Medium);
        let tomb = e.degrade(DecayLevel::Tombstone, 99).unwrap();
        idx.on_write(&tomb, Tier::Slow);
        assert!(idx.concept("x").is_empty());
        let mut q = [0.0f32; SLOT_DIM];
        q[5] = 1.0;
        assert!(idx.nearest(&q, 3).is_empty());
        assert_eq!(idx.strand_frames(strand_id("s")), vec![5]);
    }

    #[test]
    fn test_on_remove_forgets_frame() {
        let idx = index();
        idx.on_write(&entry(1, "s", 10, &["c"]), Tier::Fast);
        idx.on_remove(1, Some(Tier::Fast));
        assert!(idx.strand_frames(strand_id("s")).is_empty());
        assert!(idx.time_range(0, 100).is_empty());
        assert!(idx.concept("c").is_empty());
        assert_eq!(idx.strand_of(1), None);
        let fast = &idx.stats().filters[0].1;
        assert_eq!(fast.removed, 1);
    }

    #[test]
    fn test_on_move_updates_filters() {
        let idx = index();
        idx.on_write(&entry(1, "s", 10, &[]), Tier::Fast);
        idx.on_move(1, Tier::Fast, Tier::Medium);
        assert!(idx.may_contain(Tier::Medium, 1));
        idx.rebuild_filter(Tier::Fast, &[]);
        assert!(!idx.may_contain(Tier::Fast, 1));
    }

    #[test]
    fn test_nearest_in_strand_skips_other_strands() {
        let idx = index();
        // strand "b" owns the frames closest to the query
        for id in 1..=12 {
            let strand = if id % 4 == 0 { "a" } else { "b" };
            idx.on_write(&entry(id, strand, id, &[]), Tier::Fast);
        }
        idx.converge();
        let mut q = [0.0f32; SLOT_DIM];
        for (i, x) in q.iter_mut().enumerate().take(13) {
            *x = i as f32;
        }
        let hits = idx.nearest_in_strand(strand_id("a"), &q, 2);
        assert_eq!(hits.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![12, 8]);
        assert_eq!(idx.nearest_in_strand(strand_id("a"), &q, 10).len(), 3);
        assert!(idx.nearest_in_strand(strand_id("none"), &q, 2).is_empty());
        assert_eq!(idx.strands().len(), 2);
    }

    #[test]
    fn test_converge_keeps_results() {
        let idx = index();
        for id in 1..=10 {
            idx.on_write(&entry(id, "s", id, &[]), Tier::Fast);
        }
        assert_eq!(idx.pending_semantic(), 10);
        assert_eq!(idx.converge(), 10);
        assert_eq!(idx.pending_semantic(), 0);
        let mut q = [0.0f32; SLOT_DIM];
        q[7] = 1.0;
        assert_eq!(idx.nearest(&q, 1)[0].0, 7);
    }
}
