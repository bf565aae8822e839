//! Garbage Collector: retention scoring and one-way decay transitions.
//!
//! `Full → Compressed → Gist → Tombstone`. The collector decides how far a
//! frame *should* decay and produces the lower-resolution entry; it never
//! decides when to run. The tier manager and the bleed engine call it during
//! demotion, archival and decay sweeps, and log the result to the WAL.
//!
//! Retention score, with age measured from last access:
//!
//! ```text
//! 0.40·exp(−age_days / age_scale) + 0.35·γ + 0.15·ln(1 + refs) + 0.10·pinned
//! ```
//!
//! clamped to [0, 1]. Immortal frames (γ = 1.0, refs above the threshold, or
//! pinned) score 1.0 and every transition on them is a no-op. A frame that
//! any other frame still references decays no further than `Gist`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::GcConfig;
use crate::frame::{DecayLevel, Entry};

const MICROS_PER_DAY: f64 = 86_400.0 * 1_000_000.0;

const W_RECENCY: f64 = 0.40;
const W_GAMMA: f64 = 0.35;
const W_REFS: f64 = 0.15;
const W_PINNED: f64 = 0.10;

/// Result of asking for a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Entry),
    /// Already at or below the target, or immortal.
    NoOp,
}

// ── Counts ─────────────────────────────────────────────────────────

/// Live frames per decay state.
#[derive(Debug, Default)]
pub struct GcCounts {
    by_level: [AtomicU64; 4],
    transitions: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcCountsSnapshot {
    pub full: u64,
    pub compressed: u64,
    pub gist: u64,
    pub tombstone: u64,
    pub transitions: u64,
}

impl GcCounts {
    fn slot(&self, level: DecayLevel) -> &AtomicU64 {
        &self.by_level[level as usize]
    }

    pub fn record(&self, level: DecayLevel) {
        self.slot(level).fetch_add(1, Ordering::Relaxed);
    }

    pub fn forget(&self, level: DecayLevel) {
        let _ = self
            .slot(level)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn moved(&self, from: DecayLevel, to: DecayLevel) {
        if from == to {
            return;
        }
        self.forget(from);
        self.record(to);
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcCountsSnapshot {
        GcCountsSnapshot {
            full: self.slot(DecayLevel::Full).load(Ordering::Relaxed),
            compressed: self.slot(DecayLevel::Compressed).load(Ordering::Relaxed),
            gist: self.slot(DecayLevel::Gist).load(Ordering::Relaxed),
            tombstone: self.slot(DecayLevel::Tombstone).load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }
}

// ── Collector ──────────────────────────────────────────────────────

pub struct GarbageCollector {
    config: GcConfig,
    counts: GcCounts,
}

impl GarbageCollector {
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            counts: GcCounts::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn counts(&self) -> &GcCounts {
        &self.counts
    }

    pub fn is_immortal(&self, entry: &Entry) -> bool {
        if entry.is_tombstone() {
            return false;
        }
        entry.pinned()
            || entry.gamma().is_some_and(|g| g >= 1.0)
            || entry.ref_count() > self.config.immortal_ref_threshold
    }

    pub fn retention_score(&self, entry: &Entry, last_access: u64, now: u64) -> f64 {
        if entry.is_tombstone() {
            return 0.0;
        }
        if self.is_immortal(entry) {
            return 1.0;
        }
        let age_days = now.saturating_sub(last_access) as f64 / MICROS_PER_DAY;
        let scale = self.config.age_scale_days.max(f64::EPSILON);
        let gamma = entry.gamma().unwrap_or(0.0).clamp(0.0, 1.0) as f64;
        let refs = (1.0 + entry.ref_count() as f64).ln();
        let pinned = if entry.pinned() { 1.0 } else { 0.0 };
        let score =
            W_RECENCY * (-age_days / scale).exp() + W_GAMMA * gamma + W_REFS * refs + W_PINNED * pinned;
        score.clamp(0.0, 1.0)
    }

    /// Where retention says `entry` belongs; never above its current level.
    pub fn target_level(&self, entry: &Entry, last_access: u64, now: u64) -> DecayLevel {
        let current = entry.level();
        if current == DecayLevel::Tombstone || self.is_immortal(entry) {
            return current;
        }
        let score = self.retention_score(entry, last_access, now);
        let desired = if score < self.config.tombstone_below {
            DecayLevel::Tombstone
        } else if score < self.config.gist_below {
            DecayLevel::Gist
        } else if score < self.config.compress_below {
            DecayLevel::Compressed
        } else {
            DecayLevel::Full
        };
        desired.max(self.floor(entry)).min(current)
    }

    /// Lowest level `entry` may reach while it is still referenced.
    fn floor(&self, entry: &Entry) -> DecayLevel {
        if entry.ref_count() > 0 {
            DecayLevel::Gist
        } else {
            DecayLevel::Tombstone
        }
    }

    /// Degrade `entry` to `target`. Idempotent and one-directional.
    pub fn transition(&self, entry: &Entry, target: DecayLevel, now: u64) -> Transition {
        let target = target.max(self.floor(entry));
        if target >= entry.level() || self.is_immortal(entry) {
            return Transition::NoOp;
        }
        match entry.degrade(target, now) {
            Some(degraded) => Transition::Applied(degraded),
            None => Transition::NoOp,
        }
    }

    pub fn compress(&self, entry: &Entry, now: u64) -> Transition {
        self.transition(entry, DecayLevel::Compressed, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, SLOT_DIM};

    const DAY: u64 = 86_400 * 1_000_000;

    fn gc() -> GarbageCollector {
        GarbageCollector::new(GcConfig::default())
    }

    fn entry(gamma: f32) -> Entry {
        let mut frame = Frame::new("gc");
        frame.id = 1;
        let mut v = [0.0f32; SLOT_DIM];
        v[0] = 1.0;
        frame.fill_slot(0, gamma, &[(0, v), (1, v), (2, v), (3, v)]).unwrap();
        Entry::Full(frame)
    }

    #[test]
    fn test_fresh_high_gamma_stays_full() {
        let gc = gc();
        let e = entry(0.9);
        // 0.40 + 0.35·0.9 = 0.715
        let score = gc.retention_score(&e, 0, 0);
        assert!((score - 0.715).abs() < 1e-6);
        assert_eq!(gc.target_level(&e, 0, 0), DecayLevel::Full);
    }

    #[test]
    fn test_age_drives_decay() {
        let gc = gc();
        let e = entry(0.2);
        assert_eq!(gc.target_level(&e, 0, 0), DecayLevel::Compressed);
        // 0.35·0.2 = 0.07 once recency has vanished
        assert_eq!(gc.target_level(&e, 0, 3650 * DAY), DecayLevel::Tombstone);
    }

    #[test]
    fn test_immortality_rules() {
        let gc = gc();
        assert!(gc.is_immortal(&entry(1.0)));
        let mut pinned = entry(0.1);
        pinned.set_pinned(true);
        assert!(gc.is_immortal(&pinned));
        let mut referenced = entry(0.1);
        referenced.set_ref_count(11);
        assert!(gc.is_immortal(&referenced));
        referenced.set_ref_count(10);
        assert!(!gc.is_immortal(&referenced));

        let e = entry(1.0);
        assert_eq!(gc.retention_score(&e, 0, 10_000 * DAY), 1.0);
        assert_eq!(gc.target_level(&e, 0, 10_000 * DAY), DecayLevel::Full);
        assert_eq!(gc.transition(&e, DecayLevel::Tombstone, 0), Transition::NoOp);
    }

    #[test]
    fn test_referenced_frame_stops_at_gist() {
        let gc = GarbageCollector::new(GcConfig {
            tombstone_below: 0.3,
            ..GcConfig::default()
        });
        let mut e = entry(0.05);
        e.set_ref_count(3);
        // 0.35·0.05 + 0.15·ln 4 ≈ 0.225, below the tombstone line
        assert!(gc.retention_score(&e, 0, 3650 * DAY) < 0.3);
        assert_eq!(gc.target_level(&e, 0, 3650 * DAY), DecayLevel::Gist);

        let Transition::Applied(gist) = gc.transition(&e, DecayLevel::Tombstone, 0) else {
            panic!("expected gist");
        };
        assert_eq!(gist.level(), DecayLevel::Gist);
        assert_eq!(gc.transition(&gist, DecayLevel::Tombstone, 0), Transition::NoOp);

        let mut released = gist.clone();
        released.set_ref_count(0);
        let Transition::Applied(t) = gc.transition(&released, DecayLevel::Tombstone, 0) else {
            panic!("expected tombstone");
        };
        assert!(t.is_tombstone());
    }

    #[test]
    fn test_transition_is_idempotent() {
        let gc = gc();
        let Transition::Applied(compressed) = gc.compress(&entry(0.5), 0) else {
            panic!("expected compression");
        };
        assert_eq!(compressed.level(), DecayLevel::Compressed);
        assert_eq!(gc.compress(&compressed, 0), Transition::NoOp);
        assert_eq!(gc.transition(&compressed, DecayLevel::Full, 0), Transition::NoOp);
        let Transition::Applied(gist) = gc.transition(&compressed, DecayLevel::Gist, 0) else {
            panic!("expected gist");
        };
        assert_eq!(gc.compress(&gist, 0), Transition::NoOp);
    }

    #[test]
    fn test_compressed_fits_budget() {
        let gc = gc();
        let Transition::Applied(c) = gc.compress(&entry(0.5), 0) else {
            panic!("expected compression");
        };
        assert!(c.byte_size() <= 8 * 1024);
        assert!(c.byte_size() < entry(0.5).byte_size());
    }

    #[test]
    fn test_counts() {
        let gc = gc();
        gc.counts().record(DecayLevel::Full);
        gc.counts().record(DecayLevel::Full);
        gc.counts().moved(DecayLevel::Full, DecayLevel::Compressed);
        gc.counts().forget(DecayLevel::Gist);
        let snap = gc.counts().snapshot();
        assert_eq!(snap.full, 1);
        assert_eq!(snap.compressed, 1);
        assert_eq!(snap.gist, 0);
        assert_eq!(snap.transitions, 1);
    }
}
