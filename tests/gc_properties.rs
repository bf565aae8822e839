//! Property tests: garbage-collection transitions.
//!
//! - Transitions only ever lower the decay level
//! - Re-applying a transition is a no-op
//! - γ = 1.0 frames never reach Tombstone, whatever the age or access pattern
//! - Referenced frames never reach Tombstone, whatever the tombstone threshold

use proptest::prelude::*;

use voltdb::config::GcConfig;
use voltdb::frame::{DecayLevel, Entry, Frame, MAX_SLOTS, NUM_RESOLUTIONS, SLOT_DIM};
use voltdb::gc::{GarbageCollector, Transition};

const DAY: u64 = 86_400 * 1_000_000;

fn build(gammas: &[f32], refs: u32, pinned: bool) -> Entry {
    let mut frame = Frame::new("props");
    frame.id = 1;
    frame.created_at = 0;
    frame.ref_count = refs;
    frame.pinned = pinned;
    for (slot, gamma) in gammas.iter().enumerate() {
        let mut v = [0.0f32; SLOT_DIM];
        v[slot] = 1.0;
        frame.fill_slot(slot, *gamma, &[(0, v), (1, v), (2, v), (3, v)]).unwrap();
    }
    Entry::Full(frame)
}

fn level_strategy() -> impl Strategy<Value = DecayLevel> {
    prop_oneof![
        Just(DecayLevel::Full),
        Just(DecayLevel::Compressed),
        Just(DecayLevel::Gist),
        Just(DecayLevel::Tombstone),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn transitions_are_monotonic(
        gammas in prop::collection::vec(0.0f32..1.0, 1..4),
        refs in 0u32..20,
        pinned in any::<bool>(),
        ages in prop::collection::vec(0u64..4000, 1..6),
    ) {
        let gc = GarbageCollector::new(GcConfig::default());
        let mut entry = build(&gammas, refs, pinned);
        let mut now = 0u64;
        for age in ages {
            now += age * DAY;
            let before = entry.level();
            let target = gc.target_level(&entry, 0, now);
            prop_assert!(target <= before);
            if let Transition::Applied(next) = gc.transition(&entry, target, now) {
                prop_assert!(next.level() < before);
                prop_assert_eq!(next.level(), target);
                prop_assert_eq!(next.id(), entry.id());
                entry = next;
            }
        }
    }

    #[test]
    fn transitions_are_idempotent(
        gamma in 0.0f32..0.99,
        target in level_strategy(),
    ) {
        let gc = GarbageCollector::new(GcConfig::default());
        let entry = build(&[gamma], 0, false);
        let once = match gc.transition(&entry, target, DAY) {
            Transition::Applied(e) => e,
            Transition::NoOp => entry.clone(),
        };
        prop_assert_eq!(gc.transition(&once, target, 2 * DAY), Transition::NoOp);
        if once.level() <= DecayLevel::Compressed {
            prop_assert_eq!(gc.compress(&once, 3 * DAY), Transition::NoOp);
        }
    }

    #[test]
    fn certain_frames_never_tombstone(
        extra_slots in 0usize..3,
        age_days in 0u64..100_000,
        last_access_days in 0u64..100_000,
        target in level_strategy(),
    ) {
        let gc = GarbageCollector::new(GcConfig::default());
        let entry = build(&vec![1.0f32; 1 + extra_slots], 0, false);
        let now = age_days * DAY;
        let last = last_access_days.min(age_days) * DAY;

        prop_assert!(gc.is_immortal(&entry));
        prop_assert_eq!(gc.target_level(&entry, last, now), DecayLevel::Full);
        prop_assert_eq!(gc.transition(&entry, target, now), Transition::NoOp);
        prop_assert!((gc.retention_score(&entry, last, now) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn referenced_frames_never_tombstone(
        gamma in 0.0f32..0.99,
        refs in 1u32..=10,
        tombstone_below in 0.0f64..=1.0,
        idle_days in 0u64..10_000,
        target in level_strategy(),
    ) {
        let gc = GarbageCollector::new(GcConfig {
            tombstone_below,
            gist_below: tombstone_below.max(0.4),
            compress_below: tombstone_below.max(0.7),
            ..GcConfig::default()
        });
        let entry = build(&[gamma], refs, false);
        let now = idle_days * DAY;

        let planned = gc.target_level(&entry, 0, now);
        prop_assert!(planned >= DecayLevel::Gist);
        let mut current = entry;
        for _ in 0..3 {
            if let Transition::Applied(next) = gc.transition(&current, target, now) {
                prop_assert!(!next.is_tombstone());
                current = next;
            }
        }
        prop_assert!(current.level() >= DecayLevel::Gist);
        prop_assert_eq!(current.ref_count(), refs);
    }

    #[test]
    fn retention_score_is_bounded(
        gamma in 0.0f32..=1.0,
        refs in 0u32..1000,
        pinned in any::<bool>(),
        idle_days in 0u64..10_000,
    ) {
        let gc = GarbageCollector::new(GcConfig::default());
        let entry = build(&[gamma], refs, pinned);
        let score = gc.retention_score(&entry, 0, idle_days * DAY);
        prop_assert!((0.0..=1.0).contains(&score));
    }
}

#[test]
fn dense_frame_compresses_within_8k() {
    let gc = GarbageCollector::new(GcConfig::default());
    let mut frame = Frame::new("dense");
    frame.id = 2;
    for slot in 0..MAX_SLOTS {
        let levels: Vec<(usize, [f32; SLOT_DIM])> = (0..NUM_RESOLUTIONS)
            .map(|level| {
                let mut v = [0.0f32; SLOT_DIM];
                for (i, x) in v.iter_mut().enumerate() {
                    *x = ((i * 3 + slot * 5 + level) % 19) as f32 - 9.0;
                }
                (level, v)
            })
            .collect();
        frame.fill_slot(slot, 0.5, &levels).unwrap();
    }
    let full = Entry::Full(frame);
    let Transition::Applied(compressed) = gc.compress(&full, DAY) else {
        panic!("full frame should compress");
    };
    assert!(compressed.byte_size() <= 8 * 1024, "compressed {} bytes", compressed.byte_size());
    assert!(compressed.byte_size() * 8 < full.byte_size());
}

#[test]
fn compress_twice_is_noop() {
    let gc = GarbageCollector::new(GcConfig::default());
    let entry = build(&[0.4, 0.6], 0, false);
    let Transition::Applied(compressed) = gc.compress(&entry, DAY) else {
        panic!("full frame should compress");
    };
    assert_eq!(compressed.level(), DecayLevel::Compressed);
    assert_eq!(gc.compress(&compressed, 2 * DAY), Transition::NoOp);
}
