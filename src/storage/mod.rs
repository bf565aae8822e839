//! Storage engine: durable log-structured frame store.
//!
//! - `wal`: per-strand write-ahead logs with checksummed, resyncable records
//! - `memtable`: mutable buffer of recent versions
//! - `mvcc`: epochs, reader snapshots and version chains
//! - `run`: immutable memory-mapped sorted runs
//! - `compaction`: run merging
//! - `manifest`: atomic JSON manifest
//! - `engine`: the `StorageEngine` tying them together

pub mod bloom;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod mvcc;
pub mod run;
pub mod types;
pub mod wal;

pub use compaction::CompactionResult;
pub use engine::{Committed, Degraded, RecoveryStats, StorageEngine, StorageStats};
pub use mvcc::Snapshot;
pub use types::{MetadataPatch, WalOp, WalRecord};
