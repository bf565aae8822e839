//! Mutable in-memory buffer of recent versions.
//!
//! Absorbs every applied WAL record until it grows past the flush threshold,
//! then its contents become one immutable sorted run.

use std::collections::{BTreeMap, HashMap};

use super::mvcc::{Version, VersionChain};
use crate::frame::{FrameId, StrandId};

#[derive(Debug, Default)]
pub struct Memtable {
    chains: BTreeMap<FrameId, VersionChain>,
    bytes: usize,
    /// strand → last WAL sequence applied here
    applied: HashMap<StrandId, u64>,
    /// (frame, epoch that superseded an older version)
    retired: Vec<(FrameId, u64)>,
}

/// Everything a flush needs, taken out of the memtable in one step.
#[derive(Debug, Default)]
pub struct FrozenMemtable {
    pub chains: BTreeMap<FrameId, VersionChain>,
    pub applied: HashMap<StrandId, u64>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, id: FrameId, version: Version, strand: StrandId, seq: u64) {
        self.bytes += version.byte_len();
        let epoch = version.epoch;
        let chain = self.chains.entry(id).or_default();
        if !chain.is_empty() {
            self.retired.push((id, epoch));
        }
        chain.push(version);
        let applied = self.applied.entry(strand).or_insert(0);
        *applied = (*applied).max(seq);
    }

    /// Version visible at `snapshot`, if this memtable holds one.
    pub fn get(&self, id: FrameId, snapshot: u64) -> Option<&Version> {
        self.chains.get(&id).and_then(|c| c.read_at(snapshot))
    }

    pub fn newest(&self, id: FrameId) -> Option<&Version> {
        self.chains.get(&id).and_then(|c| c.newest())
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.chains.contains_key(&id)
    }

    /// Reclaim versions superseded at or before `oldest_active`.
    /// Returns `(versions, bytes)` reclaimed.
    pub fn reclaim(&mut self, oldest_active: u64) -> (usize, usize) {
        let mut versions = 0;
        let mut bytes = 0;
        let mut pending = Vec::new();
        for (id, retired_at) in std::mem::take(&mut self.retired) {
            if retired_at > oldest_active {
                pending.push((id, retired_at));
                continue;
            }
            if let Some(chain) = self.chains.get_mut(&id) {
                let (v, b) = chain.gc(oldest_active);
                versions += v;
                bytes += b;
            }
        }
        self.retired = pending;
        self.bytes = self.bytes.saturating_sub(bytes);
        (versions, bytes)
    }

    pub fn freeze(&mut self) -> FrozenMemtable {
        self.bytes = 0;
        self.retired.clear();
        FrozenMemtable {
            chains: std::mem::take(&mut self.chains),
            applied: std::mem::take(&mut self.applied),
        }
    }

    pub fn chains(&self) -> impl Iterator<Item = (&FrameId, &VersionChain)> {
        self.chains.iter()
    }

    pub fn applied_seq(&self, strand: StrandId) -> Option<u64> {
        self.applied.get(&strand).copied()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
