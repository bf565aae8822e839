//! Strand routing: strand id → partition handle, O(1).

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::frame::{FrameId, StrandId};

/// Everything routing knows about one strand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionHandle {
    pub strand: StrandId,
    pub frames: BTreeSet<FrameId>,
    /// Newest `created_at` among the strand's frames.
    pub newest_at: u64,
}

#[derive(Debug, Default)]
pub struct StrandRouting {
    partitions: HashMap<StrandId, PartitionHandle>,
    frame_strand: HashMap<FrameId, StrandId>,
}

impl StrandRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `id` to `strand`. A frame that changes strand is moved.
    pub fn insert(&mut self, strand: StrandId, id: FrameId, created_at: u64) {
        if let Some(old) = self.frame_strand.insert(id, strand) {
            if old != strand {
                self.detach(old, id);
            }
        }
        let handle = self.partitions.entry(strand).or_insert_with(|| PartitionHandle {
            strand,
            ..Default::default()
        });
        handle.frames.insert(id);
        handle.newest_at = handle.newest_at.max(created_at);
    }

    pub fn remove(&mut self, id: FrameId) -> Option<StrandId> {
        let strand = self.frame_strand.remove(&id)?;
        self.detach(strand, id);
        Some(strand)
    }

    fn detach(&mut self, strand: StrandId, id: FrameId) {
        if let Some(handle) = self.partitions.get_mut(&strand) {
            handle.frames.remove(&id);
            if handle.frames.is_empty() {
                self.partitions.remove(&strand);
            }
        }
    }

    pub fn partition(&self, strand: StrandId) -> Option<&PartitionHandle> {
        self.partitions.get(&strand)
    }

    pub fn strand_of(&self, id: FrameId) -> Option<StrandId> {
        self.frame_strand.get(&id).copied()
    }

    /// Every routed strand, ascending.
    pub fn strands(&self) -> Vec<StrandId> {
        let mut strands: Vec<StrandId> = self.partitions.keys().copied().collect();
        strands.sort_unstable();
        strands
    }

    pub fn strand_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_strand.len()
    }
}
