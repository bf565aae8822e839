//! Bleed Engine: background maintenance of the tiers.
//!
//! A bounded pool of worker threads consumes [`BleedTask`]s from a bounded
//! `crossbeam-channel` queue. A scheduler thread wakes every `tick_ms` and
//! enqueues whatever duties apply (index convergence, fast-tier eviction,
//! archival, prefetch, consolidation, wisdom consolidation, decay sweep,
//! run compaction). Each
//! duty is queued at most once at a time; a full queue drops the task.
//!
//! On-demand recall goes through the same queue. The requester waits on a
//! reply channel for at most `recall_timeout_ms`; on timeout it gets
//! `VoltError::Timeout` and the load still completes in the background.
//!
//! [`BleedEngine::pause`] holds the workers before their next task and stops
//! the scheduler from planning; queued work resumes in order afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BleedConfig;
use crate::error::{Result, VoltError};
use crate::frame::{now_micros, Entry, FrameId};
use crate::index::IndexSet;
use crate::metrics::{Metrics, Op};
use crate::storage::StorageEngine;
use crate::tier::{Tier, TierManager};
use crate::wisdom::WisdomEngine;

const DUTY_COUNT: usize = 8;

/// Decay sweep, wisdom consolidation and compaction run every this many
/// ticks (and when idle).
const MAINTENANCE_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Duty {
    Converge,
    Evict,
    Archive { idle: bool },
    Prefetch,
    Consolidate,
    Wisdom,
    DecaySweep,
    Compact,
}

impl Duty {
    fn slot(self) -> usize {
        match self {
            Duty::Converge => 0,
            Duty::Evict => 1,
            Duty::Archive { .. } => 2,
            Duty::Prefetch => 3,
            Duty::Consolidate => 4,
            Duty::DecaySweep => 5,
            Duty::Compact => 6,
            Duty::Wisdom => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Duty::Converge => "converge",
            Duty::Evict => "evict",
            Duty::Archive { .. } => "archive",
            Duty::Prefetch => "prefetch",
            Duty::Consolidate => "consolidate",
            Duty::Wisdom => "wisdom",
            Duty::DecaySweep => "decay_sweep",
            Duty::Compact => "compact",
        }
    }
}

pub enum BleedTask {
    Duty(Duty),
    Recall {
        id: FrameId,
        reply: Sender<Result<Arc<Entry>>>,
    },
}

/// What one synchronous cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub converged: usize,
    pub evicted: usize,
    pub archived: usize,
    pub prefetched: usize,
    pub consolidated: usize,
    pub wisdom_frames: usize,
    pub decayed: usize,
    pub ghosts_expired: usize,
    pub filters_rebuilt: usize,
    pub compacted: bool,
    pub reclaimed_versions: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BleedStats {
    pub running: bool,
    pub paused: bool,
    pub workers: usize,
    pub queued: usize,
    pub tasks_run: u64,
    pub tasks_dropped: u64,
    pub tasks_failed: u64,
    pub recalls: u64,
    pub recall_timeouts: u64,
    pub cycles: u64,
}

#[derive(Default)]
struct Counters {
    tasks_run: AtomicU64,
    tasks_dropped: AtomicU64,
    tasks_failed: AtomicU64,
    recalls: AtomicU64,
    recall_timeouts: AtomicU64,
    cycles: AtomicU64,
}

/// State shared by the scheduler, the workers and foreground callers.
struct Duties {
    config: BleedConfig,
    sweep_batch: usize,
    tiers: Arc<TierManager>,
    index: Arc<IndexSet>,
    storage: Arc<StorageEngine>,
    metrics: Arc<Metrics>,
    wisdom: Option<Arc<WisdomEngine>>,
    running: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
    queued: [AtomicBool; DUTY_COUNT],
    /// Bumped by foreground operations; idle detection watches it.
    activity: AtomicU64,
    counters: Counters,
}

impl Duties {
    fn plan(&self, tick: u64, idle: bool) -> Vec<Duty> {
        let mut plan = Vec::with_capacity(DUTY_COUNT);
        if self.index.pending_semantic() > 0 {
            plan.push(Duty::Converge);
        }
        if self.tiers.over_threshold(Tier::Fast) {
            plan.push(Duty::Evict);
        }
        if idle || self.tiers.over_threshold(Tier::Medium) {
            plan.push(Duty::Archive { idle });
        }
        plan.push(Duty::Prefetch);
        plan.push(Duty::Consolidate);
        if idle || tick % MAINTENANCE_EVERY == 0 {
            if self.wisdom.as_ref().is_some_and(|w| w.config().enabled) {
                plan.push(Duty::Wisdom);
            }
            plan.push(Duty::DecaySweep);
            plan.push(Duty::Compact);
        }
        plan
    }

    /// Queue `duty` unless it is already queued. Returns false once the
    /// queue is disconnected.
    fn enqueue(&self, queue: &Sender<BleedTask>, duty: Duty) -> bool {
        let flag = &self.queued[duty.slot()];
        if flag.swap(true, Ordering::AcqRel) {
            return true;
        }
        match queue.try_send(BleedTask::Duty(duty)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                flag.store(false, Ordering::Release);
                self.counters.tasks_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(duty = duty.as_str(), "bleed queue full, task dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                flag.store(false, Ordering::Release);
                false
            }
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }

    fn execute(&self, task: BleedTask) {
        match task {
            BleedTask::Recall { id, reply } => {
                let result = self.tiers.promote(id);
                // The requester may have timed out and gone.
                let _ = reply.send(result);
            }
            BleedTask::Duty(duty) => {
                self.queued[duty.slot()].store(false, Ordering::Release);
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
                match self.perform(duty) {
                    Ok(0) => {}
                    Ok(n) => debug!(duty = duty.as_str(), affected = n, "bleed duty"),
                    Err(e) => {
                        self.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(duty = duty.as_str(), error = %e, "bleed duty failed");
                    }
                }
            }
        }
        self.counters.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    fn perform(&self, duty: Duty) -> Result<usize> {
        match duty {
            Duty::Converge => Ok(self.index.converge()),
            Duty::Evict => self.tiers.evict(Tier::Fast),
            Duty::Archive { idle } => self.archive(idle),
            Duty::Prefetch => self.tiers.prefetch(self.config.prefetch_batch),
            Duty::Consolidate => {
                self.index.converge();
                self.tiers.consolidate(self.config.consolidation_batch)
            }
            Duty::Wisdom => self.consolidate_wisdom(),
            Duty::DecaySweep => {
                let decayed = self.tiers.decay_sweep(self.sweep_batch, now_micros())?;
                self.tiers.expire_ghosts();
                self.tiers.rebuild_filters();
                Ok(decayed)
            }
            Duty::Compact => self.compact().map(usize::from),
        }
    }

    fn archive(&self, idle: bool) -> Result<usize> {
        let started = Instant::now();
        let moved = self.tiers.archive(idle, self.config.archive_batch)?;
        if moved > 0 {
            self.metrics.record(Op::Archive, started.elapsed().as_millis() as u64);
        }
        Ok(moved)
    }

    fn consolidate_wisdom(&self) -> Result<usize> {
        match &self.wisdom {
            Some(wisdom) => Ok(wisdom.consolidate()?.wisdom_frames.len()),
            None => Ok(0),
        }
    }

    fn compact(&self) -> Result<bool> {
        let compacted = match self.storage.maybe_compact()? {
            Some(result) => {
                self.metrics.record(Op::Compact, result.duration_ms);
                true
            }
            None => false,
        };
        self.storage.reclaim();
        Ok(compacted)
    }

    fn cycle(&self, idle: bool) -> Result<CycleReport> {
        let mut report = CycleReport {
            converged: self.index.converge(),
            evicted: self.tiers.evict(Tier::Fast)?,
            archived: self.archive(idle)?,
            prefetched: self.tiers.prefetch(self.config.prefetch_batch)?,
            ..CycleReport::default()
        };
        report.converged += self.index.converge();
        report.consolidated = self.tiers.consolidate(self.config.consolidation_batch)?;
        report.wisdom_frames = self.consolidate_wisdom()?;
        report.decayed = self.tiers.decay_sweep(self.sweep_batch, now_micros())?;
        report.ghosts_expired = self.tiers.expire_ghosts();
        report.filters_rebuilt = self.tiers.rebuild_filters();
        report.compacted = self.compact()?;
        report.reclaimed_versions = self.storage.reclaim().0;
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }
}

fn worker_loop(duties: Arc<Duties>, tasks: Receiver<BleedTask>) {
    for task in tasks.iter() {
        duties.wait_while_paused();
        duties.execute(task);
    }
}

fn scheduler_loop(duties: Arc<Duties>, queue: Sender<BleedTask>, stop: Receiver<()>) {
    let tick = Duration::from_millis(duties.config.tick_ms.max(1));
    let mut ticks = 0u64;
    let mut quiet = 0u32;
    let mut seen = duties.activity.load(Ordering::Relaxed);
    loop {
        match stop.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        ticks += 1;
        let activity = duties.activity.load(Ordering::Relaxed);
        if activity == seen {
            quiet = quiet.saturating_add(1);
        } else {
            quiet = 0;
            seen = activity;
        }
        let idle = quiet >= duties.config.idle_ticks;
        if duties.is_paused() {
            continue;
        }
        for duty in duties.plan(ticks, idle) {
            if !duties.enqueue(&queue, duty) {
                return;
            }
        }
    }
}

pub struct BleedEngine {
    duties: Arc<Duties>,
    queue: Mutex<Option<Sender<BleedTask>>>,
    stop: Mutex<Option<Sender<()>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BleedEngine {
    /// Engine wired to the tiers. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: BleedConfig,
        sweep_batch: usize,
        tiers: Arc<TierManager>,
        index: Arc<IndexSet>,
        storage: Arc<StorageEngine>,
        metrics: Arc<Metrics>,
        wisdom: Option<Arc<WisdomEngine>>,
    ) -> Self {
        let duties = Duties {
            config,
            sweep_batch,
            tiers,
            index,
            storage,
            metrics,
            wisdom,
            running: AtomicBool::new(false),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            queued: Default::default(),
            activity: AtomicU64::new(0),
            counters: Counters::default(),
        };
        Self {
            duties: Arc::new(duties),
            queue: Mutex::new(None),
            stop: Mutex::new(None),
            scheduler: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BleedConfig {
        &self.duties.config
    }

    pub fn is_running(&self) -> bool {
        self.duties.running.load(Ordering::Acquire)
    }

    /// Open the task queue and mark the engine running.
    fn connect(&self) -> Receiver<BleedTask> {
        let (tx, rx) = bounded(self.duties.config.queue_capacity.max(1));
        *self.queue.lock() = Some(tx);
        self.duties.running.store(true, Ordering::Release);
        rx
    }

    /// Spawn the workers and the scheduler. No-op when disabled or
    /// already running.
    pub fn start(&self) -> Result<()> {
        if !self.duties.config.enabled || self.is_running() {
            return Ok(());
        }
        let tasks = self.connect();
        let workers = self.duties.config.workers.max(1);
        {
            let mut handles = self.workers.lock();
            for n in 0..workers {
                let duties = Arc::clone(&self.duties);
                let tasks = tasks.clone();
                let handle = thread::Builder::new()
                    .name(format!("voltdb-bleed-{n}"))
                    .spawn(move || worker_loop(duties, tasks))?;
                handles.push(handle);
            }
        }

        let queue = self.queue.lock().clone().ok_or(VoltError::ShuttingDown)?;
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let duties = Arc::clone(&self.duties);
        let scheduler = thread::Builder::new()
            .name("voltdb-bleed-scheduler".to_string())
            .spawn(move || scheduler_loop(duties, queue, stop_rx))?;
        *self.stop.lock() = Some(stop_tx);
        *self.scheduler.lock() = Some(scheduler);
        info!(
            workers,
            tick_ms = self.duties.config.tick_ms,
            queue = self.duties.config.queue_capacity,
            "bleed engine started"
        );
        Ok(())
    }

    /// Record foreground traffic; the scheduler treats a quiet stretch of
    /// `idle_ticks` as idle.
    pub fn note_activity(&self) {
        self.duties.activity.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue `duty` for the workers. Returns false if it was dropped.
    pub fn submit(&self, duty: Duty) -> bool {
        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return false;
        };
        let before = self.duties.counters.tasks_dropped.load(Ordering::Relaxed);
        self.duties.enqueue(queue, duty) && self.duties.counters.tasks_dropped.load(Ordering::Relaxed) == before
    }

    /// Load the canonical copy of `id` into the fast tier on the pool,
    /// waiting at most `recall_timeout_ms`. Without a running pool (or
    /// with a full queue) the load runs on the caller's thread.
    pub fn recall(&self, id: FrameId) -> Result<Arc<Entry>> {
        let started = Instant::now();
        let (reply, response) = bounded(1);
        let sent = match self.queue.lock().as_ref() {
            Some(queue) => queue.try_send(BleedTask::Recall { id, reply }).is_ok(),
            None => false,
        };
        if !sent {
            return self.duties.tiers.promote(id);
        }
        self.duties.counters.recalls.fetch_add(1, Ordering::Relaxed);

        let timeout = Duration::from_millis(self.duties.config.recall_timeout_ms);
        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                self.duties.counters.recall_timeouts.fetch_add(1, Ordering::Relaxed);
                self.duties.metrics.record_recall_timeout();
                warn!(frame = id, waited_ms, "on-demand recall timed out");
                Err(VoltError::Timeout { waited_ms })
            }
            Err(RecvTimeoutError::Disconnected) => self.duties.tiers.promote(id),
        }
    }

    /// One full cycle on the caller's thread: converge, evict, archive,
    /// prefetch, consolidate, wisdom, decay sweep, compact, reclaim.
    pub fn run_cycle(&self, idle: bool) -> Result<CycleReport> {
        self.duties.cycle(idle)
    }

    /// Hold every worker before its next task. Recalls queued meanwhile
    /// time out for the caller and complete after [`resume`](Self::resume).
    pub fn pause(&self) {
        let mut paused = self.duties.paused.lock();
        if !*paused {
            *paused = true;
            info!("bleed engine paused");
        }
    }

    pub fn resume(&self) {
        let mut paused = self.duties.paused.lock();
        if *paused {
            *paused = false;
            self.duties.resumed.notify_all();
            info!("bleed engine resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.duties.is_paused()
    }

    pub fn stats(&self) -> BleedStats {
        let c = &self.duties.counters;
        BleedStats {
            running: self.is_running(),
            paused: self.is_paused(),
            workers: self.workers.lock().len(),
            queued: self.queue.lock().as_ref().map_or(0, |q| q.len()),
            tasks_run: c.tasks_run.load(Ordering::Relaxed),
            tasks_dropped: c.tasks_dropped.load(Ordering::Relaxed),
            tasks_failed: c.tasks_failed.load(Ordering::Relaxed),
            recalls: c.recalls.load(Ordering::Relaxed),
            recall_timeouts: c.recall_timeouts.load(Ordering::Relaxed),
            cycles: c.cycles.load(Ordering::Relaxed),
        }
    }

    /// Stop the scheduler, let the workers finish queued recalls, and
    /// join every thread. Queued duties are skipped.
    pub fn shutdown(&self) {
        if !self.duties.running.swap(false, Ordering::AcqRel) {
            return;
        }
        drop(self.stop.lock().take());
        if let Some(handle) = self.scheduler.lock().take() {
            if handle.join().is_err() {
                warn!("bleed scheduler panicked");
            }
        }
        drop(self.queue.lock().take());
        self.resume();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let workers = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                warn!("bleed worker panicked");
            }
        }
        debug!(workers, "bleed engine stopped");
    }
}

impl Drop for BleedEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, IndexConfig, StorageConfig, TierConfig};
    use crate::frame::{Frame, SLOT_DIM};
    use crate::gc::GarbageCollector;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        storage: Arc<StorageEngine>,
        tiers: Arc<TierManager>,
        engine: BleedEngine,
    }

    fn harness(config: BleedConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            StorageEngine::open(
                dir.path(),
                StorageConfig {
                    sync_wal: false,
                    ..StorageConfig::default()
                },
            )
            .unwrap(),
        );
        let index = Arc::new(IndexSet::new(&IndexConfig::default(), [64, 64, 64]));
        let gc = Arc::new(GarbageCollector::new(GcConfig::default()));
        let metrics = Arc::new(Metrics::new());
        let tiers = Arc::new(TierManager::new(
            TierConfig::default(),
            Arc::clone(&storage),
            Arc::clone(&index),
            gc,
            Arc::clone(&metrics),
        ));
        let engine = BleedEngine::new(config, 64, Arc::clone(&tiers), index, Arc::clone(&storage), metrics, None);
        Harness {
            _dir: dir,
            storage,
            tiers,
            engine,
        }
    }

    fn put(h: &Harness, id: FrameId) {
        let mut frame = Frame::new("bleed");
        frame.id = id;
        let mut v = [0.0f32; SLOT_DIM];
        v[id as usize] = 1.0;
        frame.fill_slot(0, 0.5, &[(0, v)]).unwrap();
        let entry = Entry::Full(frame);
        h.storage.store(&entry).unwrap();
        h.tiers.place(entry).unwrap();
    }

    #[test]
    fn test_recall_without_pool_is_synchronous() {
        let h = harness(BleedConfig::default());
        put(&h, 1);
        h.tiers.demote(1).unwrap();
        let entry = h.engine.recall(1).unwrap();
        assert_eq!(entry.id(), 1);
        assert_eq!(h.tiers.locate(1), Some(Tier::Fast));
        assert_eq!(h.engine.stats().recalls, 0);
    }

    #[test]
    fn test_recall_times_out_and_completes_later() {
        let h = harness(BleedConfig {
            recall_timeout_ms: 5,
            ..BleedConfig::default()
        });
        put(&h, 2);
        h.tiers.demote(2).unwrap();

        // queue open, no workers draining it
        let tasks = h.engine.connect();
        let err = h.engine.recall(2).unwrap_err();
        assert!(matches!(err, VoltError::Timeout { .. }));
        assert_eq!(h.engine.stats().recall_timeouts, 1);
        assert_eq!(h.tiers.locate(2), Some(Tier::Medium));

        let task = tasks.try_recv().unwrap();
        h.engine.duties.execute(task);
        assert_eq!(h.tiers.locate(2), Some(Tier::Fast));
    }

    #[test]
    fn test_paused_pool_holds_recalls_until_resumed() {
        let h = harness(BleedConfig {
            enabled: true,
            workers: 1,
            tick_ms: 60_000,
            recall_timeout_ms: 10,
            ..BleedConfig::default()
        });
        put(&h, 5);
        h.tiers.demote(5).unwrap();
        h.engine.start().unwrap();
        h.engine.pause();
        assert!(h.engine.stats().paused);

        assert!(matches!(h.engine.recall(5), Err(VoltError::Timeout { .. })));
        assert_eq!(h.tiers.locate(5), Some(Tier::Medium));

        h.engine.resume();
        let mut loaded = false;
        for _ in 0..200 {
            if h.tiers.locate(5) == Some(Tier::Fast) {
                loaded = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(loaded, "queued recall never ran after resume");
        assert_eq!(h.engine.stats().recall_timeouts, 1);
    }

    #[test]
    fn test_shutdown_releases_paused_workers() {
        let h = harness(BleedConfig {
            enabled: true,
            workers: 2,
            tick_ms: 60_000,
            ..BleedConfig::default()
        });
        h.engine.start().unwrap();
        h.engine.pause();
        h.engine.shutdown();
        assert!(!h.engine.is_paused());
        assert_eq!(h.engine.stats().workers, 0);
    }

    #[test]
    fn test_duties_are_queued_once() {
        let h = harness(BleedConfig::default());
        let tasks = h.engine.connect();
        assert!(h.engine.submit(Duty::Prefetch));
        assert!(h.engine.submit(Duty::Prefetch));
        assert_eq!(tasks.len(), 1);
        let task = tasks.try_recv().unwrap();
        h.engine.duties.execute(task);
        assert!(h.engine.submit(Duty::Prefetch));
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_full_queue_drops_tasks() {
        let h = harness(BleedConfig {
            queue_capacity: 1,
            ..BleedConfig::default()
        });
        let _tasks = h.engine.connect();
        assert!(h.engine.submit(Duty::Prefetch));
        assert!(!h.engine.submit(Duty::Consolidate));
        assert_eq!(h.engine.stats().tasks_dropped, 1);
    }

    #[test]
    fn test_plan_when_idle() {
        let h = harness(BleedConfig::default());
        put(&h, 3);
        let plan = h.engine.duties.plan(1, true);
        assert!(plan.contains(&Duty::Converge));
        assert!(plan.contains(&Duty::Archive { idle: true }));
        assert!(plan.contains(&Duty::DecaySweep));
        assert!(!plan.contains(&Duty::Evict));
        // no wisdom engine wired in
        assert!(!plan.contains(&Duty::Wisdom));
        let busy = h.engine.duties.plan(1, false);
        assert!(!busy.contains(&Duty::DecaySweep));
    }

    #[test]
    fn test_run_cycle_converges() {
        let h = harness(BleedConfig::default());
        for id in 1..=5 {
            put(&h, id);
        }
        let report = h.engine.run_cycle(false).unwrap();
        assert_eq!(report.converged, 5);
        assert_eq!(h.engine.stats().cycles, 1);
    }

    #[test]
    fn test_start_and_shutdown() {
        let h = harness(BleedConfig {
            tick_ms: 5,
            workers: 2,
            ..BleedConfig::default()
        });
        put(&h, 4);
        h.engine.start().unwrap();
        assert!(h.engine.is_running());
        assert_eq!(h.engine.stats().workers, 2);
        std::thread::sleep(Duration::from_millis(50));
        h.engine.shutdown();
        assert!(!h.engine.is_running());
        assert_eq!(h.engine.stats().workers, 0);
        // a stopped engine recalls on the caller's thread
        assert_eq!(h.engine.recall(4).unwrap().id(), 4);
    }
}
