//! Ghost cache: weak summaries of frames evicted from the fast tier.
//!
//! A ghost is never a source of truth. It holds the frame's summary vector
//! so a similar query can trigger recall of the canonical frame, and it is
//! dropped on promotion, supersession or tombstoning, or once its TTL runs
//! out. Capacity-bounded; the least recently accessed ghost goes first.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::frame::{cosine_similarity, Entry, FrameId, GistFrame, StrandId, SLOT_DIM};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ghost {
    pub id: FrameId,
    pub strand: StrandId,
    pub gamma: Option<f32>,
    #[serde(skip)]
    pub summary: Arc<[f32; SLOT_DIM]>,
    /// Similarity of the last query that matched this ghost.
    pub similarity: f32,
    pub last_access: u64,
    pub frame_created_at: u64,
    /// When the ghost was cached; drives expiry.
    pub cached_at: u64,
}

impl Ghost {
    /// Ghost of `entry`, or `None` for entries without a summary.
    pub fn of(entry: &Entry, last_access: u64, now: u64) -> Option<Self> {
        let summary = entry.summary_vector()?;
        Some(Self {
            id: entry.id(),
            strand: entry.strand(),
            gamma: entry.gamma(),
            summary: Arc::new(summary),
            similarity: 0.0,
            last_access,
            frame_created_at: entry.created_at(),
            cached_at: now,
        })
    }

    /// The ghost as a gist entry, for ghost-only recall results.
    pub fn to_entry(&self) -> Entry {
        Entry::Gist(GistFrame {
            id: self.id,
            strand: self.strand,
            created_at: self.frame_created_at,
            gamma: self.gamma,
            parent: None,
            ref_count: 0,
            pinned: false,
            concepts: Vec::new(),
            summary: Box::new(*self.summary),
        })
    }
}

#[derive(Debug)]
pub struct GhostCache {
    capacity: usize,
    ttl_micros: u64,
    ghosts: HashMap<FrameId, Ghost>,
    /// `(last_access, id)`, oldest first.
    order: BTreeSet<(u64, FrameId)>,
}

impl GhostCache {
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_micros: ttl_secs.saturating_mul(1_000_000),
            ghosts: HashMap::new(),
            order: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, ghost: Ghost) {
        self.remove(ghost.id);
        self.order.insert((ghost.last_access, ghost.id));
        self.ghosts.insert(ghost.id, ghost);
        while self.ghosts.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.ghosts.remove(&oldest);
        }
    }

    pub fn remove(&mut self, id: FrameId) -> Option<Ghost> {
        let ghost = self.ghosts.remove(&id)?;
        self.order.remove(&(ghost.last_access, id));
        Some(ghost)
    }

    pub fn get(&self, id: FrameId) -> Option<&Ghost> {
        self.ghosts.get(&id)
    }

    fn is_expired(&self, ghost: &Ghost, now: u64) -> bool {
        now.saturating_sub(ghost.cached_at) > self.ttl_micros
    }

    /// Drop expired ghosts; returns how many.
    pub fn expire(&mut self, now: u64) -> usize {
        let expired: Vec<FrameId> = self
            .ghosts
            .values()
            .filter(|g| self.is_expired(g, now))
            .map(|g| g.id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        expired.len()
    }

    /// Live ghosts with similarity ≥ `threshold` to `query`, best first.
    /// Matching counts as an access.
    pub fn matches(&mut self, query: &[f32; SLOT_DIM], threshold: f32, now: u64) -> Vec<Ghost> {
        let mut hits: Vec<(FrameId, f32)> = self
            .ghosts
            .values()
            .filter(|g| !self.is_expired(g, now))
            .map(|g| (g.id, cosine_similarity(query, g.summary.as_ref())))
            .filter(|(_, s)| *s >= threshold)
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut out = Vec::with_capacity(hits.len());
        for (id, sim) in hits {
            if let Some(mut ghost) = self.remove(id) {
                ghost.similarity = sim;
                ghost.last_access = now;
                out.push(ghost.clone());
                self.insert(ghost);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn entry(id: FrameId, axis: usize) -> Entry {
        let mut frame = Frame::new("ghosts");
        frame.id = id;
        let mut v = [0.0f32; SLOT_DIM];
        v[axis] = 1.0;
        frame.fill_slot(0, 0.7, &[(0, v)]).unwrap();
        Entry::Full(frame)
    }

    fn ghost(id: FrameId, axis: usize, at: u64) -> Ghost {
        Ghost::of(&entry(id, axis), at, at).unwrap()
    }

    fn axis(i: usize) -> [f32; SLOT_DIM] {
        let mut v = [0.0f32; SLOT_DIM];
        v[i] = 1.0;
        v
    }

    #[test]
    fn test_capacity_drops_least_recent() {
        let mut cache = GhostCache::new(2, 3600);
        cache.insert(ghost(1, 1, 10));
        cache.insert(ghost(2, 2, 20));
        cache.insert(ghost(3, 3, 30));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_matches_respects_threshold_and_touches() {
        let mut cache = GhostCache::new(2, 3600);
        cache.insert(ghost(1, 1, 10));
        cache.insert(ghost(2, 2, 20));
        let hits = cache.matches(&axis(1), 0.85, 50);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        // ghost 1 is now the most recent, so 2 is dropped next
        cache.insert(ghost(3, 3, 60));
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_expiry() {
        let mut cache = GhostCache::new(10, 1);
        cache.insert(ghost(1, 1, 0));
        assert!(cache.matches(&axis(1), 0.5, 2_000_000).is_empty());
        assert_eq!(cache.expire(2_000_000), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ghost_entry_is_gist() {
        let g = ghost(9, 4, 0);
        let e = g.to_entry();
        assert_eq!(e.id(), 9);
        assert_eq!(e.level(), crate::frame::DecayLevel::Gist);
        assert_eq!(e.gamma(), Some(0.7));
    }
}
