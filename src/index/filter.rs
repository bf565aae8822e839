//! Per-tier negative filters.
//!
//! A bloom filter per tier answers "definitely not resident here" so a
//! locate can skip the tier's map. Bloom filters cannot delete, so removals
//! are only counted; once removals exceed half the insertions (or the
//! filter is overfilled) the owning tier rebuilds it from its resident set.
//!
//! Zero false negatives holds as long as an id is inserted before it becomes
//! resident and rebuilds run while the tier's resident set is locked.

use serde::Serialize;

use crate::frame::FrameId;
use crate::storage::bloom::BloomFilter;
use crate::tier::Tier;

const MIN_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct TierFilter {
    bloom: BloomFilter,
    capacity: usize,
    inserted: usize,
    removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub capacity: usize,
    pub inserted: usize,
    pub removed: usize,
    pub num_bits: usize,
}

impl TierFilter {
    /// Sized for `capacity` resident frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            bloom: BloomFilter::new(capacity),
            capacity,
            inserted: 0,
            removed: 0,
        }
    }

    pub fn insert(&mut self, id: FrameId) {
        self.bloom.insert(id);
        self.inserted += 1;
    }

    pub fn note_removed(&mut self) {
        self.removed += 1;
    }

    pub fn maybe_contains(&self, id: FrameId) -> bool {
        self.bloom.maybe_contains(id)
    }

    pub fn needs_rebuild(&self) -> bool {
        self.removed * 2 > self.inserted || self.inserted > self.capacity * 2
    }

    /// Replace the filter with one holding exactly `resident`.
    pub fn rebuild(&mut self, resident: &[FrameId]) {
        let capacity = self.capacity.max(resident.len() * 2);
        let mut bloom = BloomFilter::new(capacity);
        for id in resident {
            bloom.insert(*id);
        }
        self.bloom = bloom;
        self.capacity = capacity;
        self.inserted = resident.len();
        self.removed = 0;
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            capacity: self.capacity,
            inserted: self.inserted,
            removed: self.removed,
            num_bits: self.bloom.num_bits(),
        }
    }
}

/// One filter per tier, indexed by [`Tier::index`].
#[derive(Debug, Clone)]
pub struct TierFilters {
    filters: [TierFilter; 3],
}

impl TierFilters {
    pub fn new(capacities: [usize; 3]) -> Self {
        Self {
            filters: capacities.map(TierFilter::new),
        }
    }

    pub fn get(&self, tier: Tier) -> &TierFilter {
        &self.filters[tier.index()]
    }

    pub fn get_mut(&mut self, tier: Tier) -> &mut TierFilter {
        &mut self.filters[tier.index()]
    }
}
