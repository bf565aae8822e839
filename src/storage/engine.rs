//! Storage engine: per-strand WAL + memtable + sorted runs under MVCC.
//!
//! Write path: the writer lock serializes `WAL append → epoch → memtable
//! apply`, so WAL order, epoch order and visibility order agree. Readers
//! take a [`Snapshot`] and never block on the WAL.
//!
//! Lock order: `wals` → `state` → `manifest`.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::compaction::{merge_runs, CompactionResult};
use super::manifest::Manifest;
use super::memtable::Memtable;
use super::mvcc::{EpochManager, Snapshot, Version, VersionData};
use super::run::{run_file_name, write_run, RunMeta, SortedRun};
use super::types::{MetadataPatch, WalOp, WalRecord, DELETED_LEVEL};
use super::wal::{read_records, Wal};
use crate::config::StorageConfig;
use crate::error::{Result, VoltError};
use crate::frame::{decode_entry, encode_entry, now_micros, Entry, EntryView, FrameId, StrandId};

const WAL_DIR: &str = "wal";
const RUN_DIR: &str = "runs";

/// Sequence and epoch assigned to a committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub seq: u64,
    pub epoch: u64,
}

/// Outcome of [`StorageEngine::degrade`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degraded {
    /// The lower-resolution version was published.
    Committed(Committed),
    /// The stored version is already at or below the target level.
    AlreadyLower,
    /// A newer version replaced the one the degrade was derived from.
    Superseded,
}

/// What `open` found in the WALs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub strands: usize,
    pub records_replayed: usize,
    pub records_skipped: usize,
    pub truncated_tails: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub epoch: u64,
    pub active_readers: usize,
    pub memtable_bytes: usize,
    pub memtable_frames: usize,
    pub runs: usize,
    pub run_bytes: u64,
    pub flushes: u64,
    pub compactions: u64,
    pub reclaimed_versions: u64,
}

struct State {
    memtable: Memtable,
    /// Oldest first.
    runs: Vec<Arc<SortedRun>>,
}

/// Where the visible version of a frame lives.
enum Located {
    Mem(Version),
    Run(Arc<SortedRun>, super::types::RunKey),
}

struct PendingVersion {
    created_at: u64,
    level: u8,
    data: VersionData,
}

pub struct StorageEngine {
    dir: PathBuf,
    wal_dir: PathBuf,
    run_dir: PathBuf,
    config: StorageConfig,
    epochs: Arc<EpochManager>,
    wals: Mutex<HashMap<StrandId, Wal>>,
    state: RwLock<State>,
    manifest: Mutex<Manifest>,
    compaction_lock: Mutex<()>,
    next_frame_id: AtomicU64,
    recovery: RecoveryStats,
    flushes: AtomicU64,
    compactions: AtomicU64,
    reclaimed: AtomicU64,
}

impl StorageEngine {
    // ── Open / recovery ────────────────────────────────────────────

    /// Open (or create) the store under `dir` and replay every WAL.
    pub fn open(dir: &Path, config: StorageConfig) -> Result<Self> {
        let wal_dir = dir.join(WAL_DIR);
        let run_dir = dir.join(RUN_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&run_dir)?;

        let manifest = Manifest::read_from(dir)?.unwrap_or_default();
        remove_orphans(&run_dir, &manifest)?;

        let mut runs = Vec::with_capacity(manifest.runs.len());
        let mut max_epoch = manifest.last_epoch;
        let mut max_frame = manifest.next_frame_id.saturating_sub(1);
        for meta in &manifest.runs {
            let run = SortedRun::open(&run_dir, meta.id)?;
            max_epoch = max_epoch.max(run.max_epoch());
            max_frame = max_frame.max(meta.max_frame);
            runs.push(Arc::new(run));
        }

        let engine = Self {
            dir: dir.to_path_buf(),
            wal_dir: wal_dir.clone(),
            run_dir,
            config,
            epochs: Arc::new(EpochManager::new(max_epoch)),
            wals: Mutex::new(HashMap::new()),
            state: RwLock::new(State {
                memtable: Memtable::new(),
                runs,
            }),
            manifest: Mutex::new(manifest),
            compaction_lock: Mutex::new(()),
            next_frame_id: AtomicU64::new(max_frame + 1),
            recovery: RecoveryStats::default(),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        };
        engine.recover(&wal_dir)
    }

    fn recover(mut self, wal_dir: &Path) -> Result<Self> {
        let mut stats = RecoveryStats::default();
        let mut paths: Vec<PathBuf> = fs::read_dir(wal_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|x| x == "wal"))
            .collect();
        paths.sort();

        for path in paths {
            let strand_hint = self.manifest_checkpoint_for_path(&path);
            let (wal, replay) = match Wal::open(&path, strand_hint, self.config.sync_wal) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable WAL skipped");
                    continue;
                }
            };
            stats.strands += 1;
            stats.records_skipped += replay.skipped;
            stats.truncated_tails += replay.truncated_tail as usize;
            for record in &replay.records {
                match self.apply_replayed(record) {
                    Ok(()) => stats.records_replayed += 1,
                    Err(e) => {
                        warn!(
                            strand = format_args!("{:016x}", record.strand),
                            seq = record.seq,
                            error = %e,
                            "WAL record could not be applied, skipped"
                        );
                        stats.records_skipped += 1;
                    }
                }
            }
            self.wals.get_mut().insert(wal.strand(), wal);
        }

        if stats.records_replayed > 0 || stats.records_skipped > 0 {
            info!(
                strands = stats.strands,
                replayed = stats.records_replayed,
                skipped = stats.records_skipped,
                "WAL replay complete"
            );
        }
        self.recovery = stats;
        Ok(self)
    }

    fn manifest_checkpoint_for_path(&self, path: &Path) -> Option<u64> {
        let stem = path.file_stem()?.to_str()?;
        let hex = stem.strip_prefix("strand_")?;
        let strand = u64::from_str_radix(hex, 16).ok()?;
        self.manifest.lock().checkpoint(strand)
    }

    fn apply_replayed(&self, record: &WalRecord) -> Result<()> {
        let mut state = self.state.write();
        let pending = self.version_for(&state, record.op, record.frame_id, &record.payload)?;
        let epoch = self.epochs.advance();
        self.observe_frame_id(record.frame_id);
        state.memtable.apply(
            record.frame_id,
            Version {
                epoch,
                created_at: pending.created_at,
                level: pending.level,
                data: pending.data,
            },
            record.strand,
            record.seq,
        );
        Ok(())
    }

    pub fn recovery(&self) -> &RecoveryStats {
        &self.recovery
    }

    // ── Ids and epochs ─────────────────────────────────────────────

    pub fn allocate_frame_id(&self) -> FrameId {
        self.next_frame_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Keep the id counter ahead of caller-assigned ids.
    pub fn observe_frame_id(&self, id: FrameId) {
        self.next_frame_id.fetch_max(id + 1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.epochs.snapshot()
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.current()
    }

    // ── Write path ─────────────────────────────────────────────────

    /// Turn a WAL op into the version it publishes, against current state.
    fn version_for(&self, state: &State, op: WalOp, frame_id: FrameId, payload: &[u8]) -> Result<PendingVersion> {
        match op {
            WalOp::Store | WalOp::Degrade => {
                let view = EntryView::new(payload)?;
                if view.id() != frame_id {
                    return Err(VoltError::corrupt(
                        "wal",
                        format!("payload id {} under record for frame {frame_id}", view.id()),
                    ));
                }
                Ok(PendingVersion {
                    created_at: view.created_at(),
                    level: view.level() as u8,
                    data: VersionData::Entry(Arc::from(payload)),
                })
            }
            WalOp::Pin | WalOp::Unpin | WalOp::Annotate => {
                let mut entry = self.latest_in(state, frame_id)?;
                match op {
                    WalOp::Pin => entry.set_pinned(true),
                    WalOp::Unpin => entry.set_pinned(false),
                    _ => {
                        let patch = MetadataPatch::from_bytes(payload)?;
                        if let Some(refs) = patch.ref_count {
                            entry.set_ref_count(refs);
                        }
                        if let Some(pinned) = patch.pinned {
                            entry.set_pinned(pinned);
                        }
                        if patch.parent.is_some() {
                            entry.set_parent(patch.parent);
                        }
                    }
                }
                Ok(pending_for(&entry))
            }
            WalOp::Delete => Ok(PendingVersion {
                created_at: now_micros(),
                level: DELETED_LEVEL,
                data: VersionData::Deleted,
            }),
        }
    }

    /// Log then apply. `expected` is the epoch of the version the caller
    /// derived its change from; a newer version means a lost race.
    fn commit(
        &self,
        strand: StrandId,
        op: WalOp,
        frame_id: FrameId,
        payload: Vec<u8>,
        derived: Option<(Entry, Option<u64>)>,
    ) -> Result<Committed> {
        let mut wals = self.wals.lock();
        let pending = {
            let state = self.state.read();
            match &derived {
                Some((entry, expected)) => {
                    let newest = self.newest_epoch_in(&state, frame_id);
                    if newest != *expected {
                        return Err(VoltError::ConcurrentConflict(frame_id));
                    }
                    pending_for(entry)
                }
                None => self.version_for(&state, op, frame_id, &payload)?,
            }
        };

        let record = self.wal_for(&mut wals, strand)?.append(op, frame_id, payload)?;

        let mut state = self.state.write();
        let epoch = self.epochs.advance();
        state.memtable.apply(
            frame_id,
            Version {
                epoch,
                created_at: pending.created_at,
                level: pending.level,
                data: pending.data,
            },
            strand,
            record.seq,
        );
        Ok(Committed {
            seq: record.seq,
            epoch,
        })
    }

    /// `append(strand, record) → sequence number`.
    pub fn append(&self, strand: StrandId, op: WalOp, frame_id: FrameId, payload: Vec<u8>) -> Result<u64> {
        let committed = self.commit(strand, op, frame_id, payload, None)?;
        self.maybe_flush()?;
        Ok(committed.seq)
    }

    /// Store a new entry (or a whole new version of an existing one).
    pub fn store(&self, entry: &Entry) -> Result<Committed> {
        self.observe_frame_id(entry.id());
        let committed = self.commit(entry.strand(), WalOp::Store, entry.id(), encode_entry(entry), None)?;
        self.maybe_flush()?;
        Ok(committed)
    }

    /// Read-modify-write with optimistic conflict detection. `f` returns
    /// `None` to leave the frame unchanged. Conflicts are retried up to
    /// `max_conflict_retries` times before surfacing.
    pub fn update<F>(&self, id: FrameId, op: WalOp, mut f: F) -> Result<Option<(Entry, Committed)>>
    where
        F: FnMut(&Entry) -> Result<Option<Entry>>,
    {
        let mut attempt = 0;
        loop {
            let (current, epoch) = self.read_latest(id)?;
            let Some(next) = f(&current)? else {
                return Ok(None);
            };
            let payload = match op {
                WalOp::Store | WalOp::Degrade => encode_entry(&next),
                WalOp::Annotate => MetadataPatch {
                    ref_count: Some(next.ref_count()),
                    pinned: Some(next.pinned()),
                    parent: next.parent(),
                }
                .to_bytes()?,
                WalOp::Pin | WalOp::Unpin | WalOp::Delete => Vec::new(),
            };
            match self.commit(current.strand(), op, id, payload, Some((next.clone(), Some(epoch)))) {
                Ok(committed) => {
                    self.maybe_flush()?;
                    return Ok(Some((next, committed)));
                }
                Err(VoltError::ConcurrentConflict(_)) if attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!(frame = id, attempt, "version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publish `degraded`, a lower-resolution copy of `source`, provided
    /// the stored version is still `source` (metadata aside). Pin and
    /// reference count are carried over from the stored version.
    pub fn degrade(&self, id: FrameId, source: &Entry, degraded: &Entry) -> Result<Degraded> {
        let mut outcome = Degraded::Superseded;
        let result = self.update(id, WalOp::Degrade, |current| {
            if current.level() <= degraded.level() {
                outcome = Degraded::AlreadyLower;
                return Ok(None);
            }
            if !same_content(current, source) {
                outcome = Degraded::Superseded;
                return Ok(None);
            }
            let mut next = degraded.clone();
            next.set_pinned(current.pinned());
            next.set_ref_count(current.ref_count());
            Ok(Some(next))
        })?;
        Ok(match result {
            Some((_, committed)) => Degraded::Committed(committed),
            None => outcome,
        })
    }

    pub fn set_pinned(&self, id: FrameId, pinned: bool) -> Result<Entry> {
        let op = if pinned { WalOp::Pin } else { WalOp::Unpin };
        let result = self.update(id, op, |current| {
            if current.is_tombstone() || current.pinned() == pinned {
                return Ok(None);
            }
            let mut next = current.clone();
            next.set_pinned(pinned);
            Ok(Some(next))
        })?;
        match result {
            Some((entry, _)) => Ok(entry),
            None => Ok(self.read_latest(id)?.0),
        }
    }

    /// Bump the reference count of `id` by one.
    pub fn add_reference(&self, id: FrameId) -> Result<u32> {
        self.add_references(id, 1)
    }

    pub fn add_references(&self, id: FrameId, n: u32) -> Result<u32> {
        let result = self.update(id, WalOp::Annotate, |current| {
            if current.is_tombstone() || n == 0 {
                return Ok(None);
            }
            let mut next = current.clone();
            next.set_ref_count(current.ref_count().saturating_add(n));
            Ok(Some(next))
        })?;
        Ok(result.map(|(e, _)| e.ref_count()).unwrap_or(0))
    }

    /// Link `id` under `parent` unless it already has a parent. Returns the
    /// new version, or `None` when nothing changed.
    pub fn attach_parent(&self, id: FrameId, parent: FrameId) -> Result<Option<Entry>> {
        let result = self.update(id, WalOp::Annotate, |current| {
            if current.is_tombstone() || current.parent().is_some() || id == parent {
                return Ok(None);
            }
            let mut next = current.clone();
            next.set_parent(Some(parent));
            Ok(Some(next))
        })?;
        Ok(result.map(|(entry, _)| entry))
    }

    pub fn delete(&self, id: FrameId) -> Result<Committed> {
        let (entry, _) = self.read_latest(id)?;
        self.commit(entry.strand(), WalOp::Delete, id, Vec::new(), None)
    }

    /// Append to the WAL without applying: the on-disk state of a crash
    /// between the two steps.
    #[doc(hidden)]
    pub fn append_wal_only(&self, entry: &Entry) -> Result<u64> {
        let mut wals = self.wals.lock();
        let wal = self.wal_for(&mut wals, entry.strand())?;
        Ok(wal.append(WalOp::Store, entry.id(), encode_entry(entry))?.seq)
    }

    fn wal_for<'a>(&self, wals: &'a mut HashMap<StrandId, Wal>, strand: StrandId) -> Result<&'a mut Wal> {
        if !wals.contains_key(&strand) {
            let base = self.manifest.lock().checkpoint(strand).unwrap_or(0);
            wals.insert(strand, Wal::create(&self.wal_dir, strand, base, self.config.sync_wal)?);
        }
        wals.get_mut(&strand).ok_or(VoltError::ShuttingDown)
    }

    // ── Read path ──────────────────────────────────────────────────

    fn locate(&self, state: &State, id: FrameId, snapshot: u64) -> Option<Located> {
        if let Some(v) = state.memtable.get(id, snapshot) {
            return Some(Located::Mem(v.clone()));
        }
        state
            .runs
            .iter()
            .rev()
            .find_map(|run| run.find(id, snapshot).map(|k| Located::Run(Arc::clone(run), k)))
    }

    fn newest_epoch_in(&self, state: &State, id: FrameId) -> Option<u64> {
        if let Some(v) = state.memtable.newest(id) {
            return Some(v.epoch);
        }
        state.runs.iter().rev().find_map(|run| run.find(id, u64::MAX).map(|k| k.epoch))
    }

    fn latest_in(&self, state: &State, id: FrameId) -> Result<Entry> {
        match self.locate(state, id, u64::MAX) {
            Some(Located::Mem(Version {
                data: VersionData::Entry(bytes),
                ..
            })) => decode_entry(&bytes),
            Some(Located::Run(run, key)) if !key.is_delete() => decode_entry(run.blob(&key)),
            _ => Err(VoltError::NotFound(id)),
        }
    }

    /// `read(frame_id, epoch) → Frame | NotFound`.
    pub fn read(&self, id: FrameId, epoch: u64) -> Result<Entry> {
        self.with_view(id, epoch, |view| view.to_entry())?
    }

    /// Newest version and its epoch.
    pub fn read_latest(&self, id: FrameId) -> Result<(Entry, u64)> {
        let state = self.state.read();
        let epoch = self.newest_epoch_in(&state, id).ok_or(VoltError::NotFound(id))?;
        Ok((self.latest_in(&state, id)?, epoch))
    }

    /// Zero-copy access to the version visible at `epoch`.
    pub fn with_view<R>(&self, id: FrameId, epoch: u64, f: impl FnOnce(EntryView<'_>) -> R) -> Result<R> {
        let located = {
            let state = self.state.read();
            self.locate(&state, id, epoch)
        };
        match located {
            Some(Located::Mem(Version {
                data: VersionData::Entry(bytes),
                ..
            })) => Ok(f(EntryView::new(&bytes)?)),
            Some(Located::Run(run, key)) if !key.is_delete() => Ok(f(run.view(&key)?)),
            _ => Err(VoltError::NotFound(id)),
        }
    }

    pub fn contains(&self, id: FrameId) -> bool {
        let state = self.state.read();
        match self.locate(&state, id, u64::MAX) {
            Some(Located::Mem(v)) => v.data != VersionData::Deleted,
            Some(Located::Run(_, key)) => !key.is_delete(),
            None => false,
        }
    }

    /// Newest live entry of every frame.
    pub fn scan_latest(&self) -> Result<Vec<Entry>> {
        let state = self.state.read();
        let mut ids: BTreeSet<FrameId> = state.memtable.chains().map(|(id, _)| *id).collect();
        for run in &state.runs {
            ids.extend(run.keys().map(|k| k.frame_id));
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.latest_in(&state, id) {
                Ok(entry) => out.push(entry),
                Err(VoltError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// `replay(strand) → ordered records since the last checkpoint`.
    pub fn replay(&self, strand: StrandId) -> Result<Vec<WalRecord>> {
        let _wals = self.wals.lock();
        let path = Wal::path_for(&self.wal_dir, strand);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        let header = super::types::WalHeader::from_bytes(&bytes)?;
        let base = header.base_seq.max(self.manifest.lock().checkpoint(strand).unwrap_or(0));
        Ok(read_records(&bytes, strand, base).records)
    }

    /// Ask the kernel to page in the run holding `id`.
    pub fn prefetch(&self, id: FrameId) -> bool {
        let state = self.state.read();
        if state.memtable.contains(id) {
            return true;
        }
        for run in state.runs.iter().rev() {
            if let Some(key) = run.find(id, u64::MAX) {
                run.prefetch(&key);
                return true;
            }
        }
        false
    }

    // ── Flush / compaction / reclamation ───────────────────────────

    pub fn maybe_flush(&self) -> Result<Option<RunMeta>> {
        if self.state.read().memtable.bytes() < self.config.memtable_bytes {
            return Ok(None);
        }
        self.flush()
    }

    /// Write the memtable to a new run and checkpoint every WAL.
    pub fn flush(&self) -> Result<Option<RunMeta>> {
        let start = Instant::now();
        let mut wals = self.wals.lock();
        self.reclaim();

        let (records, applied) = {
            let state = self.state.read();
            if state.memtable.is_empty() {
                return Ok(None);
            }
            let mut records = Vec::new();
            for (id, chain) in state.memtable.chains() {
                records.extend(chain.versions().iter().cloned().map(|v| (*id, v)));
            }
            let applied: Vec<(StrandId, u64)> = wals
                .keys()
                .filter_map(|s| state.memtable.applied_seq(*s).map(|seq| (*s, seq)))
                .collect();
            (records, applied)
        };

        let run_id = self.manifest.lock().allocate_run_id();
        let meta = write_run(&self.run_dir, run_id, &records)?;
        let run = Arc::new(SortedRun::open(&self.run_dir, run_id)?);

        {
            let mut manifest = self.manifest.lock();
            manifest.runs.push(meta.clone());
            manifest.last_epoch = self.epochs.current();
            manifest.next_frame_id = self.next_frame_id.load(Ordering::Acquire);
            for (strand, seq) in &applied {
                let cp = manifest.checkpoints.entry(*strand).or_insert(0);
                *cp = (*cp).max(*seq);
            }
            manifest.write_to(&self.dir)?;
        }

        {
            let mut state = self.state.write();
            state.runs.push(run);
            state.memtable.freeze();
        }

        for (strand, seq) in applied {
            if let Some(wal) = wals.get_mut(&strand) {
                wal.checkpoint(seq)?;
            }
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        info!(
            run = run_id,
            versions = meta.entry_count,
            bytes = meta.bytes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "memtable flushed"
        );
        Ok(Some(meta))
    }

    pub fn maybe_compact(&self) -> Result<Option<CompactionResult>> {
        if self.state.read().runs.len() < self.config.compaction_trigger {
            return Ok(None);
        }
        self.compact()
    }

    /// Merge every live run into one.
    pub fn compact(&self) -> Result<Option<CompactionResult>> {
        let _guard = self.compaction_lock.lock();
        let start = Instant::now();
        let inputs: Vec<Arc<SortedRun>> = self.state.read().runs.clone();
        if inputs.len() < 2 {
            return Ok(None);
        }
        let (merged, mut result) = merge_runs(&inputs, self.epochs.oldest_active());
        let input_ids: BTreeSet<u64> = inputs.iter().map(|r| r.id()).collect();

        let output = if merged.is_empty() {
            None
        } else {
            let run_id = self.manifest.lock().allocate_run_id();
            let meta = write_run(&self.run_dir, run_id, &merged)?;
            Some((meta, Arc::new(SortedRun::open(&self.run_dir, run_id)?)))
        };

        {
            let mut manifest = self.manifest.lock();
            manifest.runs.retain(|m| !input_ids.contains(&m.id));
            if let Some((meta, _)) = &output {
                manifest.runs.insert(0, meta.clone());
            }
            manifest.write_to(&self.dir)?;
        }
        {
            let mut state = self.state.write();
            state.runs.retain(|r| !input_ids.contains(&r.id()));
            if let Some((_, run)) = output {
                state.runs.insert(0, run);
            }
        }
        for id in &input_ids {
            let path = self.run_dir.join(run_file_name(*id));
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove compacted run");
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        self.compactions.fetch_add(1, Ordering::Relaxed);
        info!(
            runs = result.runs_merged,
            versions_in = result.versions_in,
            versions_out = result.versions_out,
            deletes_dropped = result.deletes_dropped,
            elapsed_ms = result.duration_ms,
            "runs compacted"
        );
        Ok(Some(result))
    }

    /// Reclaim superseded memtable versions no reader can see.
    pub fn reclaim(&self) -> (usize, usize) {
        let oldest = self.epochs.oldest_active();
        let (versions, bytes) = self.state.write().memtable.reclaim(oldest);
        if versions > 0 {
            self.reclaimed.fetch_add(versions as u64, Ordering::Relaxed);
            debug!(versions, bytes, oldest_epoch = oldest, "versions reclaimed");
        }
        (versions, bytes)
    }

    pub fn stats(&self) -> StorageStats {
        let state = self.state.read();
        StorageStats {
            epoch: self.epochs.current(),
            active_readers: self.epochs.active_readers(),
            memtable_bytes: state.memtable.bytes(),
            memtable_frames: state.memtable.len(),
            runs: state.runs.len(),
            run_bytes: state.runs.iter().map(|r| r.file_bytes()).sum(),
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            reclaimed_versions: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Same frame content, ignoring pin and reference count.
fn same_content(current: &Entry, source: &Entry) -> bool {
    if current.level() != source.level() {
        return false;
    }
    let mut normalized = current.clone();
    normalized.set_pinned(source.pinned());
    normalized.set_ref_count(source.ref_count());
    normalized == *source
}

fn pending_for(entry: &Entry) -> PendingVersion {
    let bytes = encode_entry(entry);
    PendingVersion {
        created_at: entry.created_at(),
        level: entry.level() as u8,
        data: VersionData::Entry(Arc::from(bytes.into_boxed_slice())),
    }
}

/// Remove run files the manifest does not list (a crash between writing a
/// run and committing the manifest) and stale temp files.
fn remove_orphans(run_dir: &Path, manifest: &Manifest) -> Result<()> {
    let live: BTreeSet<String> = manifest.runs.iter().map(|m| run_file_name(m.id)).collect();
    for entry in fs::read_dir(run_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !live.contains(name) {
            debug!(path = %path.display(), "removing orphaned run file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DecayLevel, Frame, SLOT_DIM};
    use tempfile::TempDir;

    fn config() -> StorageConfig {
        StorageConfig {
            sync_wal: false,
            ..Default::default()
        }
    }

    fn frame(id: FrameId, strand: &str) -> Entry {
        let mut frame = Frame::new(strand);
        frame.id = id;
        frame.created_at = 1_000 + id;
        let mut v = [0.0f32; SLOT_DIM];
        v[id as usize % SLOT_DIM] = 1.0;
        frame.fill_slot(0, 0.6, &[(0, v), (1, v), (2, v)]).unwrap();
        Entry::Full(frame)
    }

    #[test]
    fn test_store_then_read() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        let c = engine.store(&frame(1, "a")).unwrap();
        assert_eq!(c.seq, 1);
        let snap = engine.snapshot();
        assert_eq!(engine.read(1, snap.epoch()).unwrap(), frame(1, "a"));
        assert!(matches!(engine.read(2, snap.epoch()), Err(VoltError::NotFound(2))));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        engine.store(&frame(1, "a")).unwrap();
        let before = engine.snapshot();
        engine.set_pinned(1, true).unwrap();
        assert!(!engine.read(1, before.epoch()).unwrap().pinned());
        let after = engine.snapshot();
        assert!(engine.read(1, after.epoch()).unwrap().pinned());
    }

    #[test]
    fn test_reclaim_waits_for_readers() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        engine.store(&frame(1, "a")).unwrap();
        let reader = engine.snapshot();
        engine.set_pinned(1, true).unwrap();
        assert_eq!(engine.reclaim().0, 0);
        assert!(!engine.read(1, reader.epoch()).unwrap().pinned());
        drop(reader);
        assert_eq!(engine.reclaim().0, 1);
    }

    #[test]
    fn test_flush_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), config()).unwrap();
            for id in 1..=5 {
                engine.store(&frame(id, "a")).unwrap();
            }
            let meta = engine.flush().unwrap().unwrap();
            assert_eq!(meta.entry_count, 5);
            engine.store(&frame(6, "a")).unwrap();
            assert!(engine.replay(strand_of("a")).unwrap().len() == 1);
        }
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        assert_eq!(engine.recovery().records_replayed, 1);
        let epoch = engine.current_epoch();
        for id in 1..=6 {
            assert_eq!(engine.read(id, epoch).unwrap().id(), id);
        }
        assert_eq!(engine.allocate_frame_id(), 7);
    }

    fn strand_of(name: &str) -> StrandId {
        crate::frame::strand_id(name)
    }

    #[test]
    fn test_replay_applies_pin_and_degrade() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), config()).unwrap();
            engine.store(&frame(1, "a")).unwrap();
            engine.set_pinned(1, true).unwrap();
            let compressed = frame(1, "a").degrade(DecayLevel::Compressed, 0).unwrap();
            let outcome = engine.degrade(1, &frame(1, "a"), &compressed).unwrap();
            assert!(matches!(outcome, Degraded::Committed(_)));
        }
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        let (entry, _) = engine.read_latest(1).unwrap();
        assert_eq!(entry.level(), DecayLevel::Compressed);
        // degrade payload was derived from the pinned version
        assert!(entry.pinned());
        let ops: Vec<WalOp> = engine.replay(strand_of("a")).unwrap().iter().map(|r| r.op).collect();
        assert_eq!(ops, vec![WalOp::Store, WalOp::Pin, WalOp::Degrade]);
    }

    #[test]
    fn test_parent_link_and_references_survive_replay() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), config()).unwrap();
            engine.store(&frame(1, "a")).unwrap();
            engine.store(&frame(2, "a")).unwrap();
            let linked = engine.attach_parent(1, 2).unwrap().unwrap();
            assert_eq!(linked.parent(), Some(2));
            // an existing link is never replaced
            assert!(engine.attach_parent(1, 9).unwrap().is_none());
            assert!(engine.attach_parent(2, 2).unwrap().is_none());
            assert_eq!(engine.add_references(2, 3).unwrap(), 3);
            assert_eq!(engine.add_references(2, 0).unwrap(), 0);
        }
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        assert_eq!(engine.read_latest(1).unwrap().0.parent(), Some(2));
        assert_eq!(engine.read_latest(2).unwrap().0.ref_count(), 3);
        assert_eq!(engine.read_latest(2).unwrap().0.parent(), None);
    }

    #[test]
    fn test_degrade_rejects_upward_move() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        let gist = frame(1, "a").degrade(DecayLevel::Gist, 0).unwrap();
        engine.store(&gist).unwrap();
        let compressed = frame(1, "a").degrade(DecayLevel::Compressed, 0).unwrap();
        assert_eq!(engine.degrade(1, &frame(1, "a"), &compressed).unwrap(), Degraded::AlreadyLower);
        assert_eq!(engine.read_latest(1).unwrap().0.level(), DecayLevel::Gist);
    }

    #[test]
    fn test_degrade_of_superseded_version_is_dropped() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        let old = frame(1, "a");
        engine.store(&old).unwrap();
        let mut newer = frame(1, "a");
        if let Entry::Full(f) = &mut newer {
            f.concepts = vec!["rewritten".into()];
        }
        engine.store(&newer).unwrap();

        let compressed = old.degrade(DecayLevel::Compressed, 0).unwrap();
        assert_eq!(engine.degrade(1, &old, &compressed).unwrap(), Degraded::Superseded);
        assert_eq!(engine.read_latest(1).unwrap().0, newer);

        // pin changes do not count as a new version
        engine.set_pinned(1, true).unwrap();
        let compressed = newer.degrade(DecayLevel::Compressed, 0).unwrap();
        assert!(matches!(engine.degrade(1, &newer, &compressed).unwrap(), Degraded::Committed(_)));
        let (stored, _) = engine.read_latest(1).unwrap();
        assert_eq!(stored.level(), DecayLevel::Compressed);
        assert!(stored.pinned());
    }

    #[test]
    fn test_delete_then_compact_drops_frame() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        engine.store(&frame(1, "a")).unwrap();
        engine.store(&frame(2, "a")).unwrap();
        engine.flush().unwrap();
        engine.delete(1).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.stats().runs, 2);

        let result = engine.compact().unwrap().unwrap();
        assert_eq!(result.runs_merged, 2);
        assert_eq!(result.deletes_dropped, 1);
        assert_eq!(engine.stats().runs, 1);
        let epoch = engine.current_epoch();
        assert!(engine.read(1, epoch).is_err());
        assert!(engine.read(2, epoch).is_ok());
        let ids: Vec<FrameId> = engine.scan_latest().unwrap().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_with_view_reads_from_run() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        engine.store(&frame(3, "a")).unwrap();
        engine.flush().unwrap();
        let epoch = engine.current_epoch();
        let (id, gamma) = engine.with_view(3, epoch, |v| (v.id(), v.gamma())).unwrap();
        assert_eq!(id, 3);
        assert_eq!(gamma, Some(0.6));
        assert!(engine.prefetch(3));
        assert!(!engine.prefetch(99));
    }

    #[test]
    fn test_add_reference_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), config()).unwrap();
            engine.store(&frame(1, "a")).unwrap();
            assert_eq!(engine.add_reference(1).unwrap(), 1);
            assert_eq!(engine.add_reference(1).unwrap(), 2);
        }
        let engine = StorageEngine::open(dir.path(), config()).unwrap();
        assert_eq!(engine.read_latest(1).unwrap().0.ref_count(), 2);
    }

    #[test]
    fn test_concurrent_updates_all_land() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(StorageEngine::open(
            dir.path(),
            StorageConfig {
                max_conflict_retries: 1000,
                ..config()
            },
        )
        .unwrap());
        engine.store(&frame(1, "a")).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        engine.add_reference(1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.read_latest(1).unwrap().0.ref_count(), 100);
    }
}
