//! Decay representations of a stored frame.
//!
//! A frame only ever moves downward: Full → Compressed → Gist → Tombstone.
//! Each step keeps less: compressed keeps the two coarsest resolutions per
//! slot (the coarser as `i8`, the finer as 4-bit), gist keeps one summary
//! vector, and a tombstone keeps only the id and a content hash.

use serde::{Deserialize, Serialize};

use super::{
    l2_normalize, Frame, FrameId, Slot, StrandId, MAX_SLOTS, NUM_RESOLUTIONS, SLOT_DIM,
};

/// Decay state, ordered by how much content survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DecayLevel {
    Tombstone = 0,
    Gist = 1,
    Compressed = 2,
    Full = 3,
}

impl DecayLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DecayLevel::Tombstone),
            1 => Some(DecayLevel::Gist),
            2 => Some(DecayLevel::Compressed),
            3 => Some(DecayLevel::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecayLevel::Tombstone => "tombstone",
            DecayLevel::Gist => "gist",
            DecayLevel::Compressed => "compressed",
            DecayLevel::Full => "full",
        }
    }
}

// ── Compressed ─────────────────────────────────────────────────────

/// Bits kept per component of a quantized vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Int8,
    /// Two components per byte on disk.
    Int4,
}

impl Precision {
    fn max_step(self) -> f32 {
        match self {
            Precision::Int8 => 127.0,
            Precision::Int4 => 7.0,
        }
    }
}

/// One vector scalar-quantized; `x ≈ data[i] as f32 * scale`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedVector {
    pub code: u16,
    pub scale: f32,
    pub precision: Precision,
    pub data: Box<[i8; SLOT_DIM]>,
}

impl QuantizedVector {
    pub fn quantize(vector: &[f32; SLOT_DIM], code: u16, precision: Precision) -> Self {
        let steps = precision.max_step();
        let max_abs = vector.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        let scale = if max_abs > 0.0 { max_abs / steps } else { 1.0 };
        let mut data = Box::new([0i8; SLOT_DIM]);
        for (q, x) in data.iter_mut().zip(vector.iter()) {
            *q = (x / scale).round().clamp(-steps, steps) as i8;
        }
        Self {
            code,
            scale,
            precision,
            data,
        }
    }

    pub fn dequantize(&self) -> [f32; SLOT_DIM] {
        let mut out = [0.0f32; SLOT_DIM];
        for (o, q) in out.iter_mut().zip(self.data.iter()) {
            *o = *q as f32 * self.scale;
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSlot {
    pub index: u8,
    pub gamma: f32,
    /// At most two levels are populated: the coarser at `Int8`, the finer
    /// at `Int4`.
    pub levels: [Option<QuantizedVector>; NUM_RESOLUTIONS],
}

impl CompressedSlot {
    pub fn level_mask(&self) -> u8 {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_some())
            .fold(0u8, |m, (i, _)| m | (1 << i))
    }
}

/// Levels kept per slot when compressing.
const COMPRESSED_LEVELS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedFrame {
    pub id: FrameId,
    pub strand: StrandId,
    pub created_at: u64,
    pub parent: Option<FrameId>,
    pub ref_count: u32,
    pub pinned: bool,
    pub concepts: Vec<String>,
    /// Filled slots in index order.
    pub slots: Vec<CompressedSlot>,
}

impl CompressedFrame {
    /// Keep the two coarsest present levels of every filled slot.
    pub fn from_frame(frame: &Frame) -> Self {
        let slots = frame
            .filled_slots()
            .map(|(index, slot)| compress_slot(index, slot))
            .collect();
        Self {
            id: frame.id,
            strand: frame.strand,
            created_at: frame.created_at,
            parent: frame.parent,
            ref_count: frame.ref_count,
            pinned: frame.pinned,
            concepts: frame.concepts.clone(),
            slots,
        }
    }

    pub fn gamma(&self) -> Option<f32> {
        self.slots.iter().map(|s| s.gamma).reduce(f32::min)
    }

    pub fn slot_mask(&self) -> u16 {
        self.slots.iter().fold(0u16, |m, s| m | (1 << s.index))
    }

    pub fn resolution_mask(&self) -> u64 {
        self.slots.iter().fold(0u64, |m, s| {
            m | ((s.level_mask() as u64) << (s.index as usize * NUM_RESOLUTIONS))
        })
    }

    pub fn summary_vector(&self) -> Option<[f32; SLOT_DIM]> {
        let mut acc = [0.0f32; SLOT_DIM];
        let mut any = false;
        for slot in &self.slots {
            if let Some(q) = slot.levels.iter().flatten().next() {
                for (a, x) in acc.iter_mut().zip(q.dequantize().iter()) {
                    *a += x;
                }
                any = true;
            }
        }
        if any && l2_normalize(&mut acc) {
            Some(acc)
        } else {
            None
        }
    }
}

fn compress_slot(index: usize, slot: &Slot) -> CompressedSlot {
    let mut levels: [Option<QuantizedVector>; NUM_RESOLUTIONS] = Default::default();
    let mut kept = 0;
    for (level, payload) in slot.levels.iter().enumerate() {
        if kept == COMPRESSED_LEVELS {
            break;
        }
        if let Some(payload) = payload {
            let precision = if kept == 0 { Precision::Int8 } else { Precision::Int4 };
            levels[level] = Some(QuantizedVector::quantize(&payload.vector, payload.code, precision));
            kept += 1;
        }
    }
    CompressedSlot {
        index: index as u8,
        gamma: slot.gamma,
        levels,
    }
}

// ── Gist ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GistFrame {
    pub id: FrameId,
    pub strand: StrandId,
    pub created_at: u64,
    pub gamma: Option<f32>,
    pub parent: Option<FrameId>,
    pub ref_count: u32,
    pub pinned: bool,
    pub concepts: Vec<String>,
    pub summary: Box<[f32; SLOT_DIM]>,
}

// ── Tombstone ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneRecord {
    pub id: FrameId,
    pub strand: StrandId,
    /// First 16 bytes of BLAKE3 over the encoding that was tombstoned.
    pub content_hash: [u8; 16],
    pub tombstoned_at: u64,
}

// ── Entry ──────────────────────────────────────────────────────────

/// A frame at any decay state. This is what storage, tiers and recall carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Full(Frame),
    Compressed(CompressedFrame),
    Gist(GistFrame),
    Tombstone(TombstoneRecord),
}

impl Entry {
    pub fn level(&self) -> DecayLevel {
        match self {
            Entry::Full(_) => DecayLevel::Full,
            Entry::Compressed(_) => DecayLevel::Compressed,
            Entry::Gist(_) => DecayLevel::Gist,
            Entry::Tombstone(_) => DecayLevel::Tombstone,
        }
    }

    pub fn id(&self) -> FrameId {
        match self {
            Entry::Full(f) => f.id,
            Entry::Compressed(c) => c.id,
            Entry::Gist(g) => g.id,
            Entry::Tombstone(t) => t.id,
        }
    }

    pub fn strand(&self) -> StrandId {
        match self {
            Entry::Full(f) => f.strand,
            Entry::Compressed(c) => c.strand,
            Entry::Gist(g) => g.strand,
            Entry::Tombstone(t) => t.strand,
        }
    }

    /// Creation time; for a tombstone, the time it was tombstoned.
    pub fn created_at(&self) -> u64 {
        match self {
            Entry::Full(f) => f.created_at,
            Entry::Compressed(c) => c.created_at,
            Entry::Gist(g) => g.created_at,
            Entry::Tombstone(t) => t.tombstoned_at,
        }
    }

    pub fn gamma(&self) -> Option<f32> {
        match self {
            Entry::Full(f) => f.gamma(),
            Entry::Compressed(c) => c.gamma(),
            Entry::Gist(g) => g.gamma,
            Entry::Tombstone(_) => None,
        }
    }

    pub fn parent(&self) -> Option<FrameId> {
        match self {
            Entry::Full(f) => f.parent,
            Entry::Compressed(c) => c.parent,
            Entry::Gist(g) => g.parent,
            Entry::Tombstone(_) => None,
        }
    }

    pub fn ref_count(&self) -> u32 {
        match self {
            Entry::Full(f) => f.ref_count,
            Entry::Compressed(c) => c.ref_count,
            Entry::Gist(g) => g.ref_count,
            Entry::Tombstone(_) => 0,
        }
    }

    pub fn pinned(&self) -> bool {
        match self {
            Entry::Full(f) => f.pinned,
            Entry::Compressed(c) => c.pinned,
            Entry::Gist(g) => g.pinned,
            Entry::Tombstone(_) => false,
        }
    }

    pub fn concepts(&self) -> &[String] {
        match self {
            Entry::Full(f) => &f.concepts,
            Entry::Compressed(c) => &c.concepts,
            Entry::Gist(g) => &g.concepts,
            Entry::Tombstone(_) => &[],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Entry::Tombstone(_))
    }

    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Entry::Full(f) => Some(f),
            _ => None,
        }
    }

    pub fn summary_vector(&self) -> Option<[f32; SLOT_DIM]> {
        match self {
            Entry::Full(f) => f.summary_vector(),
            Entry::Compressed(c) => c.summary_vector(),
            Entry::Gist(g) => Some(*g.summary),
            Entry::Tombstone(_) => None,
        }
    }

    /// Encoded size in bytes; the unit of all tier accounting.
    pub fn byte_size(&self) -> u64 {
        super::codec::encoded_len(self) as u64
    }

    pub fn content_hash(&self) -> [u8; 16] {
        match self {
            Entry::Tombstone(t) => t.content_hash,
            other => {
                let bytes = super::codec::encode_entry(other);
                let hash = blake3::hash(&bytes);
                let mut out = [0u8; 16];
                out.copy_from_slice(&hash.as_bytes()[..16]);
                out
            }
        }
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        match self {
            Entry::Full(f) => f.pinned = pinned,
            Entry::Compressed(c) => c.pinned = pinned,
            Entry::Gist(g) => g.pinned = pinned,
            Entry::Tombstone(_) => {}
        }
    }

    pub fn set_ref_count(&mut self, refs: u32) {
        match self {
            Entry::Full(f) => f.ref_count = refs,
            Entry::Compressed(c) => c.ref_count = refs,
            Entry::Gist(g) => g.ref_count = refs,
            Entry::Tombstone(_) => {}
        }
    }

    pub fn set_parent(&mut self, parent: Option<FrameId>) {
        match self {
            Entry::Full(f) => f.parent = parent,
            Entry::Compressed(c) => c.parent = parent,
            Entry::Gist(g) => g.parent = parent,
            Entry::Tombstone(_) => {}
        }
    }

    /// Lower-resolution copy at `target`, or `None` when `target` is not
    /// strictly below the current level.
    pub fn degrade(&self, target: DecayLevel, now: u64) -> Option<Entry> {
        if target >= self.level() {
            return None;
        }
        let degraded = match target {
            DecayLevel::Full => return None,
            DecayLevel::Compressed => match self {
                Entry::Full(f) => Entry::Compressed(CompressedFrame::from_frame(f)),
                _ => return None,
            },
            DecayLevel::Gist => Entry::Gist(GistFrame {
                id: self.id(),
                strand: self.strand(),
                created_at: self.created_at(),
                gamma: self.gamma(),
                parent: self.parent(),
                ref_count: self.ref_count(),
                pinned: self.pinned(),
                concepts: self.concepts().to_vec(),
                summary: Box::new(self.summary_vector().unwrap_or([0.0; SLOT_DIM])),
            }),
            DecayLevel::Tombstone => Entry::Tombstone(TombstoneRecord {
                id: self.id(),
                strand: self.strand(),
                content_hash: self.content_hash(),
                tombstoned_at: now,
            }),
        };
        Some(degraded)
    }
}

impl From<Frame> for Entry {
    fn from(frame: Frame) -> Self {
        Entry::Full(frame)
    }
}

/// Slots of a compressed entry re-expanded to full width (lossy).
pub fn expand_compressed(c: &CompressedFrame) -> [Option<Slot>; MAX_SLOTS] {
    let mut slots: [Option<Slot>; MAX_SLOTS] = Default::default();
    for cs in &c.slots {
        let mut slot = Slot {
            gamma: cs.gamma,
            levels: Default::default(),
        };
        for (level, q) in cs.levels.iter().enumerate() {
            if let Some(q) = q {
                slot.levels[level] = Some(super::SlotPayload {
                    vector: Box::new(q.dequantize()),
                    code: q.code,
                });
            }
        }
        slots[cs.index as usize] = Some(slot);
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::cosine_similarity;

    fn ramp(seed: usize) -> [f32; SLOT_DIM] {
        let mut v = [0.0f32; SLOT_DIM];
        for (i, x) in v.iter_mut().enumerate() {
            *x = (((i + seed) % 17) as f32 - 8.0) / 8.0;
        }
        v
    }

    fn full_frame() -> Frame {
        let mut frame = Frame::new("math");
        frame.id = 42;
        frame.concepts = vec!["algebra".into()];
        frame
            .fill_slot(0, 0.8, &[(0, ramp(0)), (1, ramp(1)), (2, ramp(2)), (3, ramp(3))])
            .unwrap();
        frame.fill_slot(7, 0.6, &[(2, ramp(4)), (3, ramp(5))]).unwrap();
        frame
    }

    #[test]
    fn test_decay_order() {
        assert!(DecayLevel::Full > DecayLevel::Compressed);
        assert!(DecayLevel::Compressed > DecayLevel::Gist);
        assert!(DecayLevel::Gist > DecayLevel::Tombstone);
        for v in 0..4 {
            assert_eq!(DecayLevel::from_u8(v).unwrap() as u8, v);
        }
        assert_eq!(DecayLevel::from_u8(4), None);
    }

    #[test]
    fn test_quantize_error_is_small() {
        let v = ramp(3);
        let q = QuantizedVector::quantize(&v, 9, Precision::Int8);
        let back = q.dequantize();
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).abs() <= q.scale);
        }
        assert!(cosine_similarity(&v, &back) > 0.999);

        let q4 = QuantizedVector::quantize(&v, 9, Precision::Int4);
        assert!(q4.data.iter().all(|x| (-7..=7).contains(x)));
        assert!(cosine_similarity(&v, &q4.dequantize()) > 0.99);
    }

    #[test]
    fn test_compress_keeps_two_coarsest_levels() {
        let frame = full_frame();
        let c = CompressedFrame::from_frame(&frame);
        assert_eq!(c.slots.len(), 2);
        assert_eq!(c.slots[0].level_mask(), 0b0011);
        assert_eq!(c.slots[0].levels[0].as_ref().unwrap().precision, Precision::Int8);
        assert_eq!(c.slots[0].levels[1].as_ref().unwrap().precision, Precision::Int4);
        // slot 7 only had levels 2 and 3
        assert_eq!(c.slots[1].level_mask(), 0b1100);
        assert_eq!(c.slot_mask(), frame.slot_mask());
        assert_eq!(c.gamma(), frame.gamma());
        let sim = cosine_similarity(&c.summary_vector().unwrap(), &frame.summary_vector().unwrap());
        assert!(sim > 0.99);
    }

    #[test]
    fn test_every_slot_filled_compresses_under_8k() {
        let mut frame = Frame::new("dense");
        frame.id = 7;
        for slot in 0..MAX_SLOTS {
            let levels: Vec<_> = (0..NUM_RESOLUTIONS).map(|l| (l, ramp(slot * 4 + l))).collect();
            frame.fill_slot(slot, 0.5, &levels).unwrap();
        }
        let full = Entry::Full(frame);
        let compressed = full.degrade(DecayLevel::Compressed, 1).unwrap();
        assert!(compressed.byte_size() <= 8 * 1024, "compressed {} bytes", compressed.byte_size());
        assert!(full.byte_size() > 60 * 1024);
    }

    #[test]
    fn test_degrade_is_one_directional() {
        let entry = Entry::Full(full_frame());
        let compressed = entry.degrade(DecayLevel::Compressed, 1).unwrap();
        assert_eq!(compressed.level(), DecayLevel::Compressed);
        assert!(compressed.byte_size() < entry.byte_size());

        assert!(compressed.degrade(DecayLevel::Full, 1).is_none());
        assert!(compressed.degrade(DecayLevel::Compressed, 1).is_none());

        let gist = compressed.degrade(DecayLevel::Gist, 1).unwrap();
        assert_eq!(gist.id(), 42);
        assert_eq!(gist.concepts(), &["algebra".to_string()]);
        assert!(gist.byte_size() < compressed.byte_size());

        let tomb = gist.degrade(DecayLevel::Tombstone, 99).unwrap();
        assert_eq!(tomb.created_at(), 99);
        assert_eq!(tomb.content_hash(), gist.content_hash());
        assert!(tomb.degrade(DecayLevel::Tombstone, 100).is_none());
    }

    #[test]
    fn test_full_can_skip_to_gist() {
        let entry = Entry::Full(full_frame());
        let gist = entry.degrade(DecayLevel::Gist, 1).unwrap();
        assert_eq!(gist.summary_vector(), entry.summary_vector());
    }

    #[test]
    fn test_expand_compressed_restores_masks() {
        let frame = full_frame();
        let c = CompressedFrame::from_frame(&frame);
        let restored = Frame::from_parts(c.id, c.strand, c.created_at, expand_compressed(&c));
        assert_eq!(restored.slot_mask(), frame.slot_mask());
        assert_eq!(restored.resolution_mask(), c.resolution_mask());
        restored.validate().unwrap();
    }
}
