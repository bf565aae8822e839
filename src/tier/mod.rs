//! Tier Manager: where every frame lives.
//!
//! Three tiers, fastest first:
//! - `Fast`: hot working set, entries held in memory
//! - `Medium`: warm frames, entries held in memory at full resolution
//! - `Slow`: the storage engine itself; residents are metadata only and
//!   reads go through `StorageEngine::read_latest`
//!
//! Each frame is resident in exactly one tier. Moves (eviction, demotion,
//! promotion) insert into the destination before removing from the
//! source, under `move_lock`, so a concurrent `locate` always finds a
//! copy. Every resident is an immutable `Arc`; a move verifies the source
//! resident is still the one it read and retries otherwise.
//!
//! Eviction score, lowest evicted first:
//!
//! ```text
//! (0.1 + 0.9·γ) · 2^(−idle / half_life)
//! ```
//!
//! Ties go to the older access, then the lower frame id.
//!
//! Lock order: `evicting` (fast before medium) → `move_lock` → tier
//! `frames` → index locks. `inflight` and `ghosts` are leaf locks. No
//! storage write (WAL append, sync, flush) runs under `move_lock`.

pub mod ghost;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TierConfig;
use crate::error::{Result, VoltError};
use crate::frame::{now_micros, DecayLevel, Entry, FrameId, SLOT_DIM};
use crate::gc::{GarbageCollector, Transition};
use crate::index::IndexSet;
use crate::metrics::{Metrics, Op};
use crate::storage::{Degraded, StorageEngine};

pub use ghost::{Ghost, GhostCache};

/// Idle archival only moves frames whose eviction score fell below this.
pub const IDLE_ARCHIVE_SCORE: f64 = 0.25;

/// Recent access vectors consulted per prefetch pass.
const PREFETCH_PROBES: usize = 4;

/// Times a promotion re-reads a frame that moved under it.
const MAX_INSTALL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Medium,
    Slow,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Medium, Tier::Slow];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Medium => "medium",
            Tier::Slow => "slow",
        }
    }

    pub fn slower(self) -> Option<Tier> {
        match self {
            Tier::Fast => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Slow),
            Tier::Slow => None,
        }
    }

    /// Whether residents of this tier hold the entry in memory.
    pub fn in_memory(self) -> bool {
        self != Tier::Slow
    }
}

/// `(0.1 + 0.9·γ) · 2^(−idle / half_life)`. Frames without γ score as γ = 0.
pub fn eviction_score(gamma: Option<f32>, idle_micros: u64, half_life_secs: f64) -> f64 {
    let gamma = gamma.unwrap_or(0.0).clamp(0.0, 1.0) as f64;
    let idle_secs = idle_micros as f64 / 1_000_000.0;
    let half_life = half_life_secs.max(1e-3);
    (0.1 + 0.9 * gamma) * (-idle_secs / half_life).exp2()
}

// ── Residents ──────────────────────────────────────────────────────

struct Resident {
    level: DecayLevel,
    gamma: Option<f32>,
    immortal: bool,
    bytes: u64,
    last_access: AtomicU64,
    /// `None` in the slow tier.
    entry: Option<Arc<Entry>>,
}

impl Resident {
    fn new(entry: Arc<Entry>, in_memory: bool, immortal: bool, last_access: u64) -> Self {
        Self {
            level: entry.level(),
            gamma: entry.gamma(),
            immortal,
            bytes: entry.byte_size(),
            last_access: AtomicU64::new(last_access),
            entry: in_memory.then_some(entry),
        }
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }
}

struct TierStore {
    capacity: u64,
    threshold: f64,
    used: AtomicU64,
    frames: RwLock<HashMap<FrameId, Arc<Resident>>>,
    /// Serializes evictors of this tier.
    evicting: Mutex<()>,
}

impl TierStore {
    fn new(capacity: u64, threshold: f64) -> Self {
        Self {
            capacity,
            threshold,
            used: AtomicU64::new(0),
            frames: RwLock::new(HashMap::new()),
            evicting: Mutex::new(()),
        }
    }

    fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn high_water(&self) -> u64 {
        (self.capacity as f64 * self.threshold) as u64
    }

    fn get(&self, id: FrameId) -> Option<Arc<Resident>> {
        self.frames.read().get(&id).cloned()
    }

    /// Charge `bytes` unless that would pass capacity.
    fn try_charge(&self, bytes: u64) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|n| *n <= self.capacity)
            })
            .is_ok()
    }

    fn charge(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
    }

    fn refund(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| Some(used.saturating_sub(bytes)));
    }
}

/// One in-progress promotion; followers wait on `done`.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<std::result::Result<Arc<Entry>, VoltError>>>,
    done: Condvar,
}

#[derive(Default)]
struct TierCounters {
    promotions: AtomicU64,
    joins: AtomicU64,
    evictions: AtomicU64,
    demotions: AtomicU64,
    archived: AtomicU64,
    emergency: AtomicU64,
    decayed: AtomicU64,
}

// ── Stats ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TierOccupancy {
    pub tier: Tier,
    pub frames: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub threshold: f64,
    pub occupancy: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub tiers: Vec<TierOccupancy>,
    pub ghosts: usize,
    pub in_flight: usize,
    pub promotions: u64,
    pub single_flight_joins: u64,
    pub evictions: u64,
    pub demotions: u64,
    pub archived: u64,
    pub emergency_evictions: u64,
    pub decayed: u64,
}

impl TierStats {
    pub fn tier(&self, tier: Tier) -> Option<&TierOccupancy> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

// ── Manager ────────────────────────────────────────────────────────

pub struct TierManager {
    config: TierConfig,
    storage: Arc<StorageEngine>,
    index: Arc<IndexSet>,
    gc: Arc<GarbageCollector>,
    metrics: Arc<Metrics>,
    tiers: [TierStore; 3],
    move_lock: Mutex<()>,
    inflight: Mutex<HashMap<FrameId, Arc<Flight>>>,
    ghosts: Mutex<GhostCache>,
    recent: Mutex<VecDeque<[f32; SLOT_DIM]>>,
    counters: TierCounters,
}

impl TierManager {
    pub fn new(
        config: TierConfig,
        storage: Arc<StorageEngine>,
        index: Arc<IndexSet>,
        gc: Arc<GarbageCollector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let threshold = config.eviction_threshold.clamp(0.05, 1.0);
        let tiers = [
            TierStore::new(config.fast_bytes, threshold),
            TierStore::new(config.medium_bytes, threshold),
            TierStore::new(config.slow_bytes, threshold),
        ];
        let ghosts = GhostCache::new(config.ghost_capacity, config.ghost_ttl_secs);
        Self {
            tiers,
            move_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            ghosts: Mutex::new(ghosts),
            recent: Mutex::new(VecDeque::with_capacity(config.access_ring)),
            counters: TierCounters::default(),
            config,
            storage,
            index,
            gc,
            metrics,
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    fn store(&self, tier: Tier) -> &TierStore {
        &self.tiers[tier.index()]
    }

    /// `locate(frame_id) → tier | miss`.
    pub fn locate(&self, id: FrameId) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|t| self.index.may_contain(*t, id) && self.store(*t).frames.read().contains_key(&id))
    }

    pub fn contains(&self, tier: Tier, id: FrameId) -> bool {
        self.store(tier).frames.read().contains_key(&id)
    }

    pub fn resident_ids(&self, tier: Tier) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = self.store(tier).frames.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn over_threshold(&self, tier: Tier) -> bool {
        let store = self.store(tier);
        store.used() > store.high_water()
    }

    fn is_current(&self, tier: Tier, id: FrameId, expected: &Arc<Resident>) -> bool {
        self.store(tier).get(id).is_some_and(|r| Arc::ptr_eq(&r, expected))
    }

    fn fast_resident(&self, id: FrameId) -> Option<Arc<Resident>> {
        if !self.index.may_contain(Tier::Fast, id) {
            return None;
        }
        self.store(Tier::Fast).get(id)
    }

    /// In-memory copy of `id` if it is resident in fast or medium. No
    /// promotion and no access bookkeeping.
    pub fn peek(&self, id: FrameId) -> Option<(Arc<Entry>, Tier)> {
        [Tier::Fast, Tier::Medium].into_iter().find_map(|tier| {
            let resident = self.store(tier).get(id)?;
            resident.entry.clone().map(|e| (e, tier))
        })
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Place a freshly committed entry: fast tier, or slow for tombstones.
    /// Supersedes any existing residency of the same id.
    pub fn place(&self, entry: Entry) -> Result<Tier> {
        let tier = if entry.is_tombstone() { Tier::Slow } else { Tier::Fast };
        self.install_new(tier, Arc::new(entry), now_micros())?;
        Ok(tier)
    }

    /// Place an already committed entry directly into `tier`.
    pub fn admit(&self, tier: Tier, entry: Entry) -> Result<()> {
        self.install_new(tier, Arc::new(entry), now_micros())
    }

    /// Recovery placement: full frames into medium while it stays under
    /// threshold, everything else straight to slow.
    pub fn admit_recovered(&self, entry: Entry) -> Result<Tier> {
        let medium = self.store(Tier::Medium);
        let tier = if entry.level() == DecayLevel::Full
            && medium.used().saturating_add(entry.byte_size()) <= medium.high_water()
        {
            Tier::Medium
        } else {
            Tier::Slow
        };
        self.install_new(tier, Arc::new(entry), now_micros())?;
        Ok(tier)
    }

    fn install_new(&self, tier: Tier, entry: Arc<Entry>, now: u64) -> Result<()> {
        let id = entry.id();
        let level = entry.level();
        let resident = Arc::new(Resident::new(
            Arc::clone(&entry),
            tier.in_memory(),
            self.gc.is_immortal(&entry),
            now,
        ));
        self.reserve(tier, resident.bytes)?;

        let _moving = self.move_lock.lock();
        {
            let store = self.store(tier);
            let mut frames = store.frames.write();
            self.index.on_write(&entry, tier);
            if let Some(old) = frames.insert(id, resident) {
                store.refund(old.bytes);
                self.gc.counts().forget(old.level);
            }
        }
        for other in Tier::ALL.into_iter().filter(|t| *t != tier) {
            let store = self.store(other);
            if let Some(old) = store.frames.write().remove(&id) {
                store.refund(old.bytes);
                self.gc.counts().forget(old.level);
                self.index.on_move(id, other, tier);
            }
        }
        self.gc.counts().record(level);
        self.ghosts.lock().remove(id);
        Ok(())
    }

    /// Charge `bytes` against `tier`. Past capacity, evict synchronously
    /// down to the threshold and retry once.
    fn reserve(&self, tier: Tier, bytes: u64) -> Result<()> {
        let store = self.store(tier);
        if store.try_charge(bytes) {
            return Ok(());
        }
        if tier.slower().is_some() && bytes <= store.capacity {
            self.counters.emergency.fetch_add(1, Ordering::Relaxed);
            warn!(
                tier = tier.as_str(),
                needed = bytes,
                used = store.used(),
                capacity = store.capacity,
                "tier full, evicting synchronously"
            );
            self.evict_to(tier, store.high_water().saturating_sub(bytes))?;
            if store.try_charge(bytes) {
                return Ok(());
            }
        }
        Err(VoltError::CapacityExceeded {
            tier: tier.as_str(),
            needed: bytes,
            available: store.capacity.saturating_sub(store.used()),
        })
    }

    /// Move `id` from `from` to `to`. Caller holds `move_lock` and has
    /// charged `to`. `reindex` refreshes the index with a changed entry.
    fn relocate(&self, id: FrameId, from: Tier, to: Tier, resident: Arc<Resident>, reindex: Option<&Entry>) {
        {
            let dst = self.store(to);
            let mut frames = dst.frames.write();
            self.index.on_move(id, from, to);
            if let Some(entry) = reindex {
                self.index.on_write(entry, to);
            }
            if let Some(old) = frames.insert(id, resident) {
                dst.refund(old.bytes);
            }
        }
        let src = self.store(from);
        if let Some(old) = src.frames.write().remove(&id) {
            src.refund(old.bytes);
        }
    }

    // ── Access and promotion ───────────────────────────────────────

    /// Foreground read. Fast-tier hits return directly; anything else is a
    /// cache miss that promotes. Returns the tier the frame was found in.
    pub fn fetch(&self, id: FrameId) -> Result<(Arc<Entry>, Tier)> {
        let now = now_micros();
        if let Some(resident) = self.fast_resident(id) {
            if let Some(entry) = resident.entry.clone() {
                resident.touch(now);
                self.record_access(&entry);
                return Ok((entry, Tier::Fast));
            }
        }
        let found_in = self.locate(id).unwrap_or(Tier::Slow);
        let entry = self.promote(id)?;
        if let Some(resident) = self.fast_resident(id) {
            resident.touch(now);
        }
        self.record_access(&entry);
        Ok((entry, found_in))
    }

    fn record_access(&self, entry: &Entry) {
        if self.config.access_ring == 0 {
            return;
        }
        if let Some(summary) = entry.summary_vector() {
            let mut recent = self.recent.lock();
            if recent.len() >= self.config.access_ring {
                recent.pop_front();
            }
            recent.push_back(summary);
        }
    }

    /// Bring `id` into the fast tier. Concurrent promotions of the same
    /// frame share one load: the first caller leads, the rest wait for
    /// its result.
    pub fn promote(&self, id: FrameId) -> Result<Arc<Entry>> {
        if let Some(entry) = self.fast_resident(id).and_then(|r| r.entry.clone()) {
            return Ok(entry);
        }

        let (flight, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&id) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    inflight.insert(id, Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            self.counters.joins.fetch_add(1, Ordering::Relaxed);
            let mut outcome = flight.outcome.lock();
            while outcome.is_none() {
                flight.done.wait(&mut outcome);
            }
            return match &*outcome {
                Some(Ok(entry)) => Ok(Arc::clone(entry)),
                Some(Err(e)) => Err(duplicate_error(e)),
                None => Err(VoltError::ShuttingDown),
            };
        }

        let result = self.load_into_fast(id);
        {
            let shared = match &result {
                Ok(entry) => Ok(Arc::clone(entry)),
                Err(e) => Err(duplicate_error(e)),
            };
            *flight.outcome.lock() = Some(shared);
            flight.done.notify_all();
        }
        self.inflight.lock().remove(&id);
        result
    }

    fn load_into_fast(&self, id: FrameId) -> Result<Arc<Entry>> {
        let started = Instant::now();
        let fast = self.store(Tier::Fast);
        for _ in 0..MAX_INSTALL_ATTEMPTS {
            let source = self
                .locate(id)
                .and_then(|tier| self.store(tier).get(id).map(|r| (tier, r)));
            if let Some((Tier::Fast, resident)) = &source {
                if let Some(entry) = &resident.entry {
                    return Ok(Arc::clone(entry));
                }
            }

            let entry = match source.as_ref().and_then(|(_, r)| r.entry.clone()) {
                Some(entry) => entry,
                None => {
                    self.storage.prefetch(id);
                    Arc::new(self.storage.read_latest(id)?.0)
                }
            };
            if entry.is_tombstone() {
                return Ok(entry);
            }

            let now = now_micros();
            let resident = Arc::new(Resident::new(Arc::clone(&entry), true, self.gc.is_immortal(&entry), now));
            let bytes = resident.bytes;
            self.reserve(Tier::Fast, bytes)?;

            let moving = self.move_lock.lock();
            let unchanged = match &source {
                Some((tier, r)) => self.is_current(*tier, id, r),
                None => self.locate(id).is_none(),
            };
            if !unchanged {
                drop(moving);
                fast.refund(bytes);
                continue;
            }
            match &source {
                Some((from, _)) => self.relocate(id, *from, Tier::Fast, resident, None),
                None => {
                    let mut frames = fast.frames.write();
                    self.index.on_write(&entry, Tier::Fast);
                    frames.insert(id, resident);
                    self.gc.counts().record(entry.level());
                }
            }
            drop(moving);

            self.ghosts.lock().remove(id);
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            let elapsed = started.elapsed().as_millis() as u64;
            self.metrics.record(Op::Promote, elapsed);
            debug!(
                frame = id,
                from = source.as_ref().map_or("storage", |(t, _)| t.as_str()),
                elapsed_ms = elapsed,
                "promoted to fast tier"
            );
            return Ok(entry);
        }
        // Kept moving under us; serve the canonical copy uncached.
        Ok(Arc::new(self.storage.read_latest(id)?.0))
    }

    // ── Eviction and demotion ──────────────────────────────────────

    /// Residents of `tier`, lowest eviction score first.
    fn ranked(&self, tier: Tier, now: u64) -> Vec<(FrameId, f64, u64)> {
        let half_life = self.config.half_life_secs;
        let mut ranked: Vec<(FrameId, f64, u64)> = self
            .store(tier)
            .frames
            .read()
            .iter()
            .map(|(id, r)| {
                let last = r.last_access();
                (*id, eviction_score(r.gamma, now.saturating_sub(last), half_life), last)
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked
    }

    /// Move `id` one tier slower. Returns the new tier, or `None` if it is
    /// already in slow.
    pub fn demote(&self, id: FrameId) -> Result<Option<Tier>> {
        let from = self.locate(id).ok_or(VoltError::NotFound(id))?;
        let Some(to) = from.slower() else {
            return Ok(None);
        };
        if self.demote_from(from, id, now_micros())? {
            Ok(Some(to))
        } else {
            Ok(None)
        }
    }

    /// Fast → medium moves the entry unchanged and leaves a ghost.
    /// Medium → slow compresses (immortal frames excepted), logging the
    /// compressed version to the WAL before the full copy is dropped. The
    /// log write happens before `move_lock` is taken; if the frame moved
    /// meanwhile, the durable compressed version stays and the move is
    /// abandoned.
    fn demote_from(&self, from: Tier, id: FrameId, now: u64) -> Result<bool> {
        let Some(to) = from.slower() else {
            return Ok(false);
        };
        let Some(source) = self.store(from).get(id) else {
            return Ok(false);
        };
        let Some(entry) = source.entry.clone() else {
            return Ok(false);
        };
        let last_access = source.last_access();
        let started = Instant::now();

        if to == Tier::Medium {
            let resident = Arc::new(Resident::new(Arc::clone(&entry), true, source.immortal, last_access));
            let bytes = resident.bytes;
            self.reserve(to, bytes)?;
            let moving = self.move_lock.lock();
            if !self.is_current(from, id, &source) {
                drop(moving);
                self.store(to).refund(bytes);
                return Ok(false);
            }
            self.relocate(id, from, to, resident, None);
            drop(moving);

            if let Some(ghost) = Ghost::of(&entry, last_access, now) {
                self.ghosts.lock().insert(ghost);
            }
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(frame = id, "evicted fast -> medium");
            return Ok(true);
        }

        let compressed = if source.immortal {
            None
        } else {
            match self.gc.compress(&entry, now) {
                Transition::Applied(c) => Some(Arc::new(c)),
                Transition::NoOp => None,
            }
        };
        let stored = compressed.clone().unwrap_or_else(|| Arc::clone(&entry));
        let resident = Arc::new(Resident::new(Arc::clone(&stored), false, source.immortal, last_access));
        let bytes = resident.bytes;
        self.reserve(to, bytes)?;

        if let Some(c) = &compressed {
            match self.storage.degrade(id, &entry, c) {
                Ok(Degraded::Committed(_)) | Ok(Degraded::AlreadyLower) => {}
                Ok(Degraded::Superseded) => {
                    self.store(to).refund(bytes);
                    return Ok(false);
                }
                Err(e) => {
                    self.store(to).refund(bytes);
                    return Err(e);
                }
            }
        }

        let moving = self.move_lock.lock();
        if !self.is_current(from, id, &source) {
            drop(moving);
            self.store(to).refund(bytes);
            return Ok(false);
        }
        self.relocate(id, from, to, resident, compressed.as_deref());
        drop(moving);

        self.gc.counts().moved(source.level, stored.level());
        self.counters.demotions.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed().as_millis() as u64;
        self.metrics.record(Op::Demote, elapsed);
        debug!(
            frame = id,
            level = stored.level().as_str(),
            bytes,
            elapsed_ms = elapsed,
            "demoted medium -> slow"
        );
        Ok(true)
    }

    /// Evict lowest-scoring residents of `tier` until it holds at most
    /// `target` bytes.
    fn evict_to(&self, tier: Tier, target: u64) -> Result<usize> {
        if tier.slower().is_none() {
            return Ok(0);
        }
        let store = self.store(tier);
        let _evicting = store.evicting.lock();
        let now = now_micros();
        let mut moved = 0;
        for (id, _, _) in self.ranked(tier, now) {
            if store.used() <= target {
                break;
            }
            match self.demote_from(tier, id, now) {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e @ VoltError::CapacityExceeded { .. }) => {
                    warn!(tier = tier.as_str(), error = %e, "eviction stalled");
                    break;
                }
                Err(e) => warn!(tier = tier.as_str(), frame = id, error = %e, "eviction skipped frame"),
            }
        }
        Ok(moved)
    }

    /// Evict from `tier` down to its threshold if it is above it.
    pub fn evict(&self, tier: Tier) -> Result<usize> {
        if !self.over_threshold(tier) {
            return Ok(0);
        }
        let target = self.store(tier).high_water();
        let moved = self.evict_to(tier, target)?;
        if moved > 0 {
            debug!(tier = tier.as_str(), moved, "evicted to threshold");
        }
        Ok(moved)
    }

    /// Medium → slow archival. Under pressure, down to the threshold;
    /// when `idle`, up to `batch` frames whose score fell below
    /// [`IDLE_ARCHIVE_SCORE`].
    pub fn archive(&self, idle: bool, batch: usize) -> Result<usize> {
        let moved = if self.over_threshold(Tier::Medium) {
            self.evict(Tier::Medium)?
        } else if idle {
            let medium = self.store(Tier::Medium);
            let _evicting = medium.evicting.lock();
            let now = now_micros();
            let mut moved = 0;
            for (id, score, _) in self.ranked(Tier::Medium, now) {
                if moved >= batch || score >= IDLE_ARCHIVE_SCORE {
                    break;
                }
                match self.demote_from(Tier::Medium, id, now) {
                    Ok(true) => moved += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(frame = id, error = %e, "idle archival stopped");
                        break;
                    }
                }
            }
            moved
        } else {
            0
        };
        if moved > 0 {
            self.counters.archived.fetch_add(moved as u64, Ordering::Relaxed);
            info!(moved, idle, "archived medium -> slow");
        }
        Ok(moved)
    }

    // ── Background duties ──────────────────────────────────────────

    /// Promote recently accessed medium and slow frames while the fast
    /// tier has room below its threshold.
    pub fn consolidate(&self, batch: usize) -> Result<usize> {
        let now = now_micros();
        let window = (self.config.half_life_secs * 1_000_000.0) as u64;
        let mut warm: Vec<(FrameId, f64, u64)> = Vec::new();
        for tier in [Tier::Medium, Tier::Slow] {
            let frames = self.store(tier).frames.read();
            warm.extend(
                frames
                    .iter()
                    .filter(|(_, r)| r.level != DecayLevel::Tombstone)
                    .filter(|(_, r)| now.saturating_sub(r.last_access()) < window)
                    .map(|(id, r)| {
                        let idle = now.saturating_sub(r.last_access());
                        (*id, eviction_score(r.gamma, idle, self.config.half_life_secs), r.bytes)
                    }),
            );
        }
        warm.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let fast = self.store(Tier::Fast);
        let mut promoted = 0;
        for (id, _, bytes) in warm.into_iter().take(batch) {
            if fast.used().saturating_add(bytes) > fast.high_water() {
                break;
            }
            match self.promote(id) {
                Ok(_) => promoted += 1,
                Err(e) => debug!(frame = id, error = %e, "consolidation skipped frame"),
            }
        }
        Ok(promoted)
    }

    /// Promote neighbours of recently accessed vectors ahead of demand.
    pub fn prefetch(&self, batch: usize) -> Result<usize> {
        let probes: Vec<[f32; SLOT_DIM]> = {
            let mut recent = self.recent.lock();
            let keep = recent.len().saturating_sub(PREFETCH_PROBES);
            recent.drain(..).skip(keep).collect()
        };
        let fast = self.store(Tier::Fast);
        let mut promoted = 0;
        for probe in probes.iter().rev() {
            for (id, _) in self.index.nearest(probe, batch) {
                if promoted >= batch {
                    return Ok(promoted);
                }
                let Some(tier) = self.locate(id).filter(|t| *t != Tier::Fast) else {
                    continue;
                };
                let Some(resident) = self.store(tier).get(id) else {
                    continue;
                };
                if resident.level == DecayLevel::Tombstone {
                    continue;
                }
                if fast.used().saturating_add(resident.bytes) > fast.high_water() {
                    return Ok(promoted);
                }
                if self.promote(id).is_ok() {
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    /// Apply retention decay to up to `batch` slow residents, least
    /// recently accessed first. Each transition is logged before the
    /// resident is updated.
    pub fn decay_sweep(&self, batch: usize, now: u64) -> Result<usize> {
        let slow = self.store(Tier::Slow);
        let mut candidates: Vec<(FrameId, Arc<Resident>)> = slow
            .frames
            .read()
            .iter()
            .filter(|(_, r)| r.level != DecayLevel::Tombstone && !r.immortal)
            .map(|(id, r)| (*id, Arc::clone(r)))
            .collect();
        candidates.sort_by_key(|(id, r)| (r.last_access(), *id));
        candidates.truncate(batch);

        let mut decayed = 0u64;
        for (id, source) in candidates {
            let entry = match self.storage.read_latest(id) {
                Ok((entry, _)) => entry,
                Err(VoltError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let target = self.gc.target_level(&entry, source.last_access(), now);
            let Transition::Applied(next) = self.gc.transition(&entry, target, now) else {
                continue;
            };
            if !matches!(self.storage.degrade(id, &entry, &next)?, Degraded::Committed(_)) {
                continue;
            }

            let _moving = self.move_lock.lock();
            if !self.is_current(Tier::Slow, id, &source) {
                continue;
            }
            let next = Arc::new(next);
            let resident = Arc::new(Resident::new(
                Arc::clone(&next),
                false,
                self.gc.is_immortal(&next),
                source.last_access(),
            ));
            {
                let mut frames = slow.frames.write();
                self.index.on_write(&next, Tier::Slow);
                slow.charge(resident.bytes);
                slow.refund(source.bytes);
                frames.insert(id, resident);
            }
            self.gc.counts().moved(source.level, next.level());
            if next.is_tombstone() {
                self.ghosts.lock().remove(id);
            }
            decayed += 1;
        }
        if decayed > 0 {
            self.counters.decayed.fetch_add(decayed, Ordering::Relaxed);
            debug!(decayed, "decay sweep");
        }
        Ok(decayed as usize)
    }

    /// Rebuild negative filters that drifted; returns how many.
    pub fn rebuild_filters(&self) -> usize {
        let mut rebuilt = 0;
        for tier in Tier::ALL {
            if !self.index.filter_needs_rebuild(tier) {
                continue;
            }
            let frames = self.store(tier).frames.read();
            let ids: Vec<FrameId> = frames.keys().copied().collect();
            self.index.rebuild_filter(tier, &ids);
            rebuilt += 1;
            debug!(tier = tier.as_str(), resident = ids.len(), "rebuilt tier filter");
        }
        rebuilt
    }

    // ── Metadata changes and deletion ──────────────────────────────

    /// Swap in a new version of a resident frame whose metadata changed
    /// (pin, reference count). Residency is unchanged.
    pub fn refresh(&self, entry: Entry) {
        let id = entry.id();
        let entry = Arc::new(entry);
        let _moving = self.move_lock.lock();
        let Some(tier) = self.locate(id) else {
            return;
        };
        let store = self.store(tier);
        let mut frames = store.frames.write();
        let Some(old) = frames.get(&id).cloned() else {
            return;
        };
        let resident = Arc::new(Resident::new(
            Arc::clone(&entry),
            tier.in_memory(),
            self.gc.is_immortal(&entry),
            old.last_access(),
        ));
        store.charge(resident.bytes);
        store.refund(old.bytes);
        frames.insert(id, resident);
    }

    /// Delete `id` from storage and every tier.
    pub fn remove(&self, id: FrameId) -> Result<()> {
        self.storage.delete(id)?;
        let _moving = self.move_lock.lock();
        let mut resident_in = None;
        for tier in Tier::ALL {
            let store = self.store(tier);
            if let Some(old) = store.frames.write().remove(&id) {
                store.refund(old.bytes);
                self.gc.counts().forget(old.level);
                resident_in = Some(tier);
            }
        }
        self.index.on_remove(id, resident_in);
        self.ghosts.lock().remove(id);
        Ok(())
    }

    // ── Ghosts ─────────────────────────────────────────────────────

    pub fn ghost(&self, id: FrameId) -> Option<Ghost> {
        self.ghosts.lock().get(id).cloned()
    }

    /// Ghosts similar enough to `query` to warrant a recall.
    pub fn ghost_matches(&self, query: &[f32; SLOT_DIM], threshold: f32) -> Vec<Ghost> {
        self.ghosts.lock().matches(query, threshold, now_micros())
    }

    pub fn expire_ghosts(&self) -> usize {
        self.ghosts.lock().expire(now_micros())
    }

    // ── Stats ──────────────────────────────────────────────────────

    pub fn stats(&self) -> TierStats {
        let tiers = Tier::ALL
            .into_iter()
            .map(|tier| {
                let store = self.store(tier);
                let used = store.used();
                TierOccupancy {
                    tier,
                    frames: store.frames.read().len(),
                    used_bytes: used,
                    capacity_bytes: store.capacity,
                    threshold: store.threshold,
                    occupancy: if store.capacity == 0 {
                        0.0
                    } else {
                        used as f64 / store.capacity as f64
                    },
                }
            })
            .collect();
        let c = &self.counters;
        TierStats {
            tiers,
            ghosts: self.ghosts.lock().len(),
            in_flight: self.inflight.lock().len(),
            promotions: c.promotions.load(Ordering::Relaxed),
            single_flight_joins: c.joins.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            demotions: c.demotions.load(Ordering::Relaxed),
            archived: c.archived.load(Ordering::Relaxed),
            emergency_evictions: c.emergency.load(Ordering::Relaxed),
            decayed: c.decayed.load(Ordering::Relaxed),
        }
    }
}

/// Copy of a promotion failure for single-flight followers.
fn duplicate_error(e: &VoltError) -> VoltError {
    match e {
        VoltError::NotFound(id) => VoltError::NotFound(*id),
        VoltError::CapacityExceeded { tier, needed, available } => VoltError::CapacityExceeded {
            tier,
            needed: *needed,
            available: *available,
        },
        VoltError::ConcurrentConflict(id) => VoltError::ConcurrentConflict(*id),
        VoltError::Timeout { waited_ms } => VoltError::Timeout { waited_ms: *waited_ms },
        VoltError::Corrupt { context, detail } => VoltError::Corrupt {
            context: context.clone(),
            detail: detail.clone(),
        },
        VoltError::ShuttingDown => VoltError::ShuttingDown,
        other => VoltError::Io(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
    }
}
