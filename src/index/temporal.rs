//! Temporal index: ordered `(timestamp, frame id)` keys, O(log N) insert and
//! range query.

use std::collections::{BTreeSet, HashMap};

use crate::frame::FrameId;

#[derive(Debug, Default)]
pub struct TemporalIndex {
    keys: BTreeSet<(u64, FrameId)>,
    by_frame: HashMap<FrameId, u64>,
}

impl TemporalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or re-key `id`.
    pub fn insert(&mut self, timestamp: u64, id: FrameId) {
        if let Some(old) = self.by_frame.insert(id, timestamp) {
            self.keys.remove(&(old, id));
        }
        self.keys.insert((timestamp, id));
    }

    pub fn remove(&mut self, id: FrameId) -> bool {
        match self.by_frame.remove(&id) {
            Some(ts) => self.keys.remove(&(ts, id)),
            None => false,
        }
    }

    /// Frames with `start ≤ timestamp ≤ end`, oldest first.
    pub fn range(&self, start: u64, end: u64) -> Vec<FrameId> {
        if start > end {
            return Vec::new();
        }
        self.keys
            .range((start, FrameId::MIN)..=(end, FrameId::MAX))
            .map(|(_, id)| *id)
            .collect()
    }

    /// The `n` newest frames, newest first.
    pub fn most_recent(&self, n: usize) -> Vec<FrameId> {
        self.keys.iter().rev().take(n).map(|(_, id)| *id).collect()
    }

    pub fn timestamp_of(&self, id: FrameId) -> Option<u64> {
        self.by_frame.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_frame.is_empty()
    }
}
