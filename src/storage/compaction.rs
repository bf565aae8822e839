//! Run compaction.
//!
//! Merges every live run into one, keeping per frame the newest version plus
//! any older version an active reader can still observe. A delete marker
//! that ends up as the only surviving version removes the frame entirely.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;

use super::mvcc::{Version, VersionChain, VersionData};
use super::run::SortedRun;
use crate::frame::FrameId;

/// Result of a compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub runs_merged: usize,
    pub versions_in: usize,
    pub versions_out: usize,
    /// Frames whose delete marker was physically dropped.
    pub deletes_dropped: usize,
    pub duration_ms: u64,
}

/// Merge runs (any order) into one sorted version list.
pub fn merge_runs(
    runs: &[Arc<SortedRun>],
    oldest_active: u64,
) -> (Vec<(FrameId, Version)>, CompactionResult) {
    let decoded: Vec<Vec<(FrameId, Version)>> = runs.par_iter().map(|r| r.versions()).collect();
    let versions_in = decoded.iter().map(Vec::len).sum();

    let mut by_frame: BTreeMap<FrameId, Vec<Version>> = BTreeMap::new();
    for (id, version) in decoded.into_iter().flatten() {
        by_frame.entry(id).or_default().push(version);
    }

    let mut out = Vec::with_capacity(versions_in);
    let mut deletes_dropped = 0;
    for (id, mut versions) in by_frame {
        versions.sort_by_key(|v| v.epoch);
        versions.dedup_by_key(|v| v.epoch);
        let mut chain = VersionChain::default();
        for v in versions {
            chain.push(v);
        }
        chain.gc(oldest_active);
        if chain.len() == 1 && chain.newest().map(|v| &v.data) == Some(&VersionData::Deleted) {
            deletes_dropped += 1;
            continue;
        }
        out.extend(chain.versions().iter().cloned().map(|v| (id, v)));
    }

    let result = CompactionResult {
        runs_merged: runs.len(),
        versions_in,
        versions_out: out.len(),
        deletes_dropped,
        duration_ms: 0,
    };
    (out, result)
}
