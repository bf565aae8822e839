//! Tensor frame data model.
//!
//! A frame is `[16 slots × 4 resolutions × 256 dims]`, sparse: most slots are
//! empty and most filled slots carry only the coarse resolutions. Level 0 is
//! the coarsest (discourse summary), level 3 the finest.
//!
//! Occupancy is tracked twice: a 16-bit slot mask and a 64-bit resolution
//! mask packing 4 bits per slot (slot `i` owns bits `4i..4i+4`). The masks are
//! maintained by the mutators and re-checked by [`Frame::validate`].

pub mod codec;
pub mod entry;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::codebook::Codebook;
use crate::error::{Result, VoltError};

pub use codec::{decode_entry, encode_entry, EntryView};
pub use entry::{
    CompressedFrame, DecayLevel, Entry, GistFrame, Precision, QuantizedVector, TombstoneRecord,
};

// ── Constants ──────────────────────────────────────────────────────

/// Slots per frame.
pub const MAX_SLOTS: usize = 16;

/// Resolution levels per slot (0 = coarsest).
pub const NUM_RESOLUTIONS: usize = 4;

/// Dimension of every slot payload vector.
pub const SLOT_DIM: usize = 256;

pub type FrameId = u64;
pub type StrandId = u64;

/// Derive the strand id from its name: first 8 bytes of BLAKE3(name).
pub fn strand_id(name: &str) -> StrandId {
    let hash = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ── Vector helpers ─────────────────────────────────────────────────

/// Cosine similarity in [-1, 1]. Zero vectors compare as 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na < 1e-12 || nb < 1e-12 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// L2-normalize in place. Returns false for (near) zero vectors.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < 1e-10 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

// ── Slot ───────────────────────────────────────────────────────────

/// One resolution level of a slot: the vector plus its codebook index.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotPayload {
    pub vector: Box<[f32; SLOT_DIM]>,
    /// Nearest codebook entry, assigned at store time.
    pub code: u16,
}

impl SlotPayload {
    pub fn new(vector: [f32; SLOT_DIM]) -> Self {
        Self {
            vector: Box::new(vector),
            code: 0,
        }
    }
}

/// A filled slot: certainty plus up to four resolution payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub gamma: f32,
    pub levels: [Option<SlotPayload>; NUM_RESOLUTIONS],
}

impl Slot {
    fn new(gamma: f32) -> Self {
        Self {
            gamma,
            levels: Default::default(),
        }
    }

    /// 4-bit mask of present levels.
    pub fn level_mask(&self) -> u8 {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_some())
            .fold(0u8, |m, (i, _)| m | (1 << i))
    }

    /// Coarsest present payload (level 0 preferred).
    pub fn coarsest(&self) -> Option<&SlotPayload> {
        self.levels.iter().flatten().next()
    }
}

// ── Frame ──────────────────────────────────────────────────────────

/// The unit of storage. Content is never mutated once stored; a change is a
/// new version published through the storage engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// 0 = unassigned; the store assigns an id.
    pub id: FrameId,
    pub strand: StrandId,
    /// Microseconds since the Unix epoch.
    pub created_at: u64,
    pub parent: Option<FrameId>,
    pub ref_count: u32,
    pub pinned: bool,
    /// Concept annotations feeding the concept index.
    pub concepts: Vec<String>,
    slot_mask: u16,
    resolution_mask: u64,
    slots: [Option<Slot>; MAX_SLOTS],
}

impl Frame {
    /// Empty frame owned by the named strand.
    pub fn new(strand_name: &str) -> Self {
        Self::with_strand_id(strand_id(strand_name))
    }

    pub fn with_strand_id(strand: StrandId) -> Self {
        Self {
            id: 0,
            strand,
            created_at: now_micros(),
            parent: None,
            ref_count: 0,
            pinned: false,
            concepts: Vec::new(),
            slot_mask: 0,
            resolution_mask: 0,
            slots: Default::default(),
        }
    }

    // -- Mutators (pre-store only) -------------------------------------------

    /// Mark a slot as filled with certainty `gamma`.
    pub fn set_slot(&mut self, index: usize, gamma: f32) -> Result<()> {
        check_slot(index)?;
        if !(0.0..=1.0).contains(&gamma) || gamma.is_nan() {
            return Err(VoltError::InvalidFrame(format!(
                "slot {index} certainty {gamma} outside [0, 1]"
            )));
        }
        match &mut self.slots[index] {
            Some(slot) => slot.gamma = gamma,
            empty => *empty = Some(Slot::new(gamma)),
        }
        self.slot_mask |= 1 << index;
        Ok(())
    }

    /// Write one resolution level of an already filled slot.
    pub fn write_resolution(&mut self, index: usize, level: usize, vector: [f32; SLOT_DIM]) -> Result<()> {
        check_slot(index)?;
        if level >= NUM_RESOLUTIONS {
            return Err(VoltError::InvalidFrame(format!(
                "resolution {level} out of range (max {NUM_RESOLUTIONS})"
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(VoltError::InvalidFrame(format!(
                "slot {index} level {level} contains NaN or Inf"
            )));
        }
        let slot = self.slots[index]
            .as_mut()
            .ok_or_else(|| VoltError::InvalidFrame(format!("slot {index} is empty")))?;
        slot.levels[level] = Some(SlotPayload::new(vector));
        self.resolution_mask |= 1u64 << (index * NUM_RESOLUTIONS + level);
        Ok(())
    }

    /// Convenience: fill a slot and write the given levels in one call.
    pub fn fill_slot(&mut self, index: usize, gamma: f32, levels: &[(usize, [f32; SLOT_DIM])]) -> Result<()> {
        self.set_slot(index, gamma)?;
        for (level, vector) in levels {
            self.write_resolution(index, *level, *vector)?;
        }
        Ok(())
    }

    pub fn clear_slot(&mut self, index: usize) -> Result<()> {
        check_slot(index)?;
        self.slots[index] = None;
        self.slot_mask &= !(1 << index);
        self.resolution_mask &= !(0xFu64 << (index * NUM_RESOLUTIONS));
        Ok(())
    }

    /// Assign every payload its nearest codebook index.
    pub fn assign_codes(&mut self, codebook: &Codebook) {
        for slot in self.slots.iter_mut().flatten() {
            for payload in slot.levels.iter_mut().flatten() {
                payload.code = codebook.quantize(&payload.vector).0;
            }
        }
    }

    // -- Accessors -----------------------------------------------------------

    pub fn slot_mask(&self) -> u16 {
        self.slot_mask
    }

    pub fn resolution_mask(&self) -> u64 {
        self.resolution_mask
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn has_resolution(&self, index: usize, level: usize) -> bool {
        index < MAX_SLOTS
            && level < NUM_RESOLUTIONS
            && self.resolution_mask & (1u64 << (index * NUM_RESOLUTIONS + level)) != 0
    }

    /// Filled slots in index order.
    pub fn filled_slots(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn filled_slot_count(&self) -> usize {
        self.slot_mask.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.slot_mask == 0
    }

    /// Frame certainty: minimum γ over filled slots, `None` when no slot is filled.
    pub fn gamma(&self) -> Option<f32> {
        self.filled_slots().map(|(_, s)| s.gamma).reduce(f32::min)
    }

    /// L2-normalized sum of every filled slot's coarsest vector.
    pub fn summary_vector(&self) -> Option<[f32; SLOT_DIM]> {
        let mut acc = [0.0f32; SLOT_DIM];
        let mut any = false;
        for (_, slot) in self.filled_slots() {
            if let Some(payload) = slot.coarsest() {
                for (a, x) in acc.iter_mut().zip(payload.vector.iter()) {
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

    /// Check the mask invariants against slot contents.
    pub fn validate(&self) -> Result<()> {
        let mut slot_mask = 0u16;
        let mut resolution_mask = 0u64;
        for (i, slot) in self.filled_slots() {
            slot_mask |= 1 << i;
            resolution_mask |= (slot.level_mask() as u64) << (i * NUM_RESOLUTIONS);
        }
        if slot_mask != self.slot_mask {
            return Err(VoltError::InvalidFrame(format!(
                "slot mask {:#06x} does not match filled slots {:#06x}",
                self.slot_mask, slot_mask
            )));
        }
        if resolution_mask != self.resolution_mask {
            return Err(VoltError::InvalidFrame(format!(
                "resolution mask {:#018x} does not match payloads {:#018x}",
                self.resolution_mask, resolution_mask
            )));
        }
        Ok(())
    }

    /// Rebuild a frame from decoded parts; masks are derived, then checked.
    pub(crate) fn from_parts(
        id: FrameId,
        strand: StrandId,
        created_at: u64,
        slots: [Option<Slot>; MAX_SLOTS],
    ) -> Self {
        let mut frame = Self::with_strand_id(strand);
        frame.id = id;
        frame.created_at = created_at;
        for (i, slot) in slots.iter().enumerate() {
            if let Some(slot) = slot {
                frame.slot_mask |= 1 << i;
                frame.resolution_mask |= (slot.level_mask() as u64) << (i * NUM_RESOLUTIONS);
            }
        }
        frame.slots = slots;
        frame
    }
}

fn check_slot(index: usize) -> Result<()> {
    if index >= MAX_SLOTS {
        return Err(VoltError::InvalidFrame(format!(
            "slot index {index} out of range (max {MAX_SLOTS})"
        )));
    }
    Ok(())
}
