//! Epoch-based multi-version concurrency control.
//!
//! Writers never mutate a visible version: every change publishes a new
//! version tagged with a fresh epoch. Readers register the epoch they started
//! at and see, for every frame, the newest version at or below it. A
//! superseded version is reclaimable once the oldest registered reader is at
//! or beyond the epoch that superseded it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

// ── Epoch manager ──────────────────────────────────────────────────

#[derive(Debug)]
pub struct EpochManager {
    current: AtomicU64,
    /// epoch → number of live readers pinned at it
    readers: Mutex<BTreeMap<u64, usize>>,
}

impl EpochManager {
    pub fn new(start: u64) -> Self {
        Self {
            current: AtomicU64::new(start),
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Allocate the epoch for a new version.
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a reader at the current epoch.
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        let mut readers = self.readers.lock();
        // read under the lock so reclaim never races past a new reader
        let epoch = self.current();
        *readers.entry(epoch).or_insert(0) += 1;
        Snapshot {
            epoch,
            manager: Arc::clone(self),
        }
    }

    /// Oldest epoch any live reader can observe.
    pub fn oldest_active(&self) -> u64 {
        let readers = self.readers.lock();
        readers
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current())
    }

    pub fn active_readers(&self) -> usize {
        self.readers.lock().values().sum()
    }

    fn release(&self, epoch: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&epoch);
            }
        }
    }
}

/// A registered reader. Dropping it releases the epoch.
#[derive(Debug)]
pub struct Snapshot {
    epoch: u64,
    manager: Arc<EpochManager>,
}

impl Snapshot {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.manager.release(self.epoch);
    }
}

// ── Version chain ──────────────────────────────────────────────────

/// Payload of one version: encoded entry bytes, or a delete marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionData {
    Entry(Arc<[u8]>),
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: u64,
    pub created_at: u64,
    pub level: u8,
    pub data: VersionData,
}

impl Version {
    pub fn byte_len(&self) -> usize {
        match &self.data {
            VersionData::Entry(bytes) => bytes.len(),
            VersionData::Deleted => 0,
        }
    }
}

/// Versions of one frame, oldest first.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: Vec<Version>,
}

impl VersionChain {
    pub fn push(&mut self, version: Version) {
        debug_assert!(self.versions.last().map_or(true, |v| v.epoch < version.epoch));
        self.versions.push(version);
    }

    pub fn newest(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// Newest version with `epoch <= snapshot`.
    pub fn read_at(&self, snapshot: u64) -> Option<&Version> {
        let idx = self.versions.partition_point(|v| v.epoch <= snapshot);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }

    /// Drop versions no reader at or after `oldest_active` can see.
    /// Returns `(versions reclaimed, bytes reclaimed)`.
    pub fn gc(&mut self, oldest_active: u64) -> (usize, usize) {
        let visible = self.versions.partition_point(|v| v.epoch <= oldest_active);
        if visible <= 1 {
            return (0, 0);
        }
        let dropped: Vec<Version> = self.versions.drain(..visible - 1).collect();
        (dropped.len(), dropped.iter().map(Version::byte_len).sum())
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(epoch: u64) -> Version {
        Version {
            epoch,
            created_at: 0,
            level: 3,
            data: VersionData::Entry(Arc::from(vec![epoch as u8; 4].into_boxed_slice())),
        }
    }

    #[test]
    fn test_epochs_are_monotonic() {
        let m = EpochManager::new(10);
        assert_eq!(m.current(), 10);
        assert_eq!(m.advance(), 11);
        assert_eq!(m.advance(), 12);
        assert_eq!(m.current(), 12);
    }

    #[test]
    fn test_snapshot_registration() {
        let m = Arc::new(EpochManager::new(0));
        m.advance();
        let s1 = m.snapshot();
        m.advance();
        m.advance();
        let s2 = m.snapshot();
        assert_eq!(s1.epoch(), 1);
        assert_eq!(s2.epoch(), 3);
        assert_eq!(m.oldest_active(), 1);
        assert_eq!(m.active_readers(), 2);
        drop(s1);
        assert_eq!(m.oldest_active(), 3);
        drop(s2);
        assert_eq!(m.active_readers(), 0);
        assert_eq!(m.oldest_active(), m.current());
    }

    #[test]
    fn test_read_at_picks_newest_visible() {
        let mut chain = VersionChain::default();
        chain.push(version(2));
        chain.push(version(5));
        chain.push(version(9));
        assert!(chain.read_at(1).is_none());
        assert_eq!(chain.read_at(2).unwrap().epoch, 2);
        assert_eq!(chain.read_at(8).unwrap().epoch, 5);
        assert_eq!(chain.read_at(100).unwrap().epoch, 9);
    }

    #[test]
    fn test_gc_keeps_version_visible_to_oldest_reader() {
        let mut chain = VersionChain::default();
        for e in [2, 5, 9] {
            chain.push(version(e));
        }
        // reader at 6 still sees epoch 5
        assert_eq!(chain.gc(6), (1, 4));
        assert_eq!(chain.read_at(6).unwrap().epoch, 5);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.gc(6), (0, 0));
        assert_eq!(chain.gc(9), (1, 4));
        assert_eq!(chain.len(), 1);
    }
}
