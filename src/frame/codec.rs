//! Binary entry codec and zero-copy view.
//!
//! Full, compressed and gist entries share a 64-byte header:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic: b"VXFE"
//! 4       1     decay level: u8
//! 5       1     flags: bit0 pinned, bit1 has parent, bit2 has gamma
//! 6       2     slot_mask: u16
//! 8       8     frame id: u64
//! 16      8     strand id: u64
//! 24      8     created_at: u64 (µs)
//! 32      8     resolution_mask: u64
//! 40      4     gamma: f32
//! 44      4     ref_count: u32
//! 48      8     parent: u64
//! 56      4     body_len: u32
//! 60      2     concept count: u16
//! 62      2     reserved
//! ```
//!
//! The body is a run of slot records (`index u8 | level mask u8 | reserved
//! u16 | gamma f32`) each followed by one vector per set level bit; a gist
//! body is the bare summary vector. A compressed slot holds at most two
//! vectors: the first as `i8`, the second packed two 4-bit values per byte
//! (low nibble first). Concepts (`len u16 | utf8`) follow the
//! body. Tombstones use a fixed 48-byte layout:
//!
//! ```text
//! 0   4   magic: b"VXFE"
//! 4   1   decay level: 0
//! 5   3   reserved
//! 8   8   frame id
//! 16  8   strand id
//! 24  16  content hash
//! 40  8   tombstoned_at (µs)
//! ```
//!
//! All integers and floats are little-endian.

use super::entry::{
    expand_compressed, CompressedFrame, CompressedSlot, DecayLevel, Entry, GistFrame, Precision,
    QuantizedVector, TombstoneRecord,
};
use super::{Frame, FrameId, Slot, SlotPayload, StrandId, MAX_SLOTS, NUM_RESOLUTIONS, SLOT_DIM};
use crate::error::{Result, VoltError};

// ── Constants ──────────────────────────────────────────────────────

pub const ENTRY_MAGIC: [u8; 4] = *b"VXFE";
pub const HEADER_SIZE: usize = 64;
pub const TOMBSTONE_SIZE: usize = 48;
const SLOT_RECORD_SIZE: usize = 8;
/// code u16 + pad u16 + 256 × f32
const FULL_VECTOR_SIZE: usize = 4 + SLOT_DIM * 4;
/// code u16 + pad u16 + scale f32
const QUANT_PREFIX_SIZE: usize = 8;
/// prefix + 256 × i8
const QUANT8_VECTOR_SIZE: usize = QUANT_PREFIX_SIZE + SLOT_DIM;
/// prefix + 256 × i4
const QUANT4_VECTOR_SIZE: usize = QUANT_PREFIX_SIZE + SLOT_DIM / 2;
const GIST_BODY_SIZE: usize = SLOT_DIM * 4;

const FLAG_PINNED: u8 = 1;
const FLAG_PARENT: u8 = 1 << 1;
const FLAG_GAMMA: u8 = 1 << 2;

// ── Byte helpers ───────────────────────────────────────────────────

#[inline]
pub(crate) fn read_u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

#[inline]
pub(crate) fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

#[inline]
pub(crate) fn read_u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

#[inline]
fn read_f32_at(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_vector_at(data: &[u8], offset: usize) -> [f32; SLOT_DIM] {
    let mut out = [0.0f32; SLOT_DIM];
    for (i, x) in out.iter_mut().enumerate() {
        *x = read_f32_at(data, offset + i * 4);
    }
    out
}

/// Size of the `nth` stored vector of a compressed slot.
fn quant_vector_size(nth: usize) -> usize {
    if nth == 0 {
        QUANT8_VECTOR_SIZE
    } else {
        QUANT4_VECTOR_SIZE
    }
}

fn quant_precision(nth: usize) -> Precision {
    if nth == 0 {
        Precision::Int8
    } else {
        Precision::Int4
    }
}

fn compressed_slot_body(level_mask: u8) -> usize {
    (0..level_mask.count_ones() as usize).map(quant_vector_size).sum()
}

/// Sign-extend both nibbles of a packed byte.
#[inline]
fn unpack_nibbles(b: u8) -> (i8, i8) {
    (((b << 4) as i8) >> 4, (b as i8) >> 4)
}

fn corrupt(detail: impl Into<String>) -> VoltError {
    VoltError::corrupt("entry", detail)
}

// ── Encoding ───────────────────────────────────────────────────────

/// Exact encoded length without encoding.
pub fn encoded_len(entry: &Entry) -> usize {
    let body = match entry {
        Entry::Tombstone(_) => return TOMBSTONE_SIZE,
        Entry::Full(f) => f
            .filled_slots()
            .map(|(_, s)| SLOT_RECORD_SIZE + s.level_mask().count_ones() as usize * FULL_VECTOR_SIZE)
            .sum(),
        Entry::Compressed(c) => c
            .slots
            .iter()
            .map(|s| SLOT_RECORD_SIZE + compressed_slot_body(s.level_mask()))
            .sum(),
        Entry::Gist(_) => GIST_BODY_SIZE,
    };
    let concepts: usize = entry.concepts().iter().map(|c| 2 + c.len().min(u16::MAX as usize)).sum();
    HEADER_SIZE + body + concepts
}

pub fn encode_entry(entry: &Entry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(entry));
    if let Entry::Tombstone(t) = entry {
        buf.extend_from_slice(&ENTRY_MAGIC);
        buf.push(DecayLevel::Tombstone as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&t.id.to_le_bytes());
        buf.extend_from_slice(&t.strand.to_le_bytes());
        buf.extend_from_slice(&t.content_hash);
        buf.extend_from_slice(&t.tombstoned_at.to_le_bytes());
        return buf;
    }

    let (slot_mask, resolution_mask) = match entry {
        Entry::Full(f) => (f.slot_mask(), f.resolution_mask()),
        Entry::Compressed(c) => (c.slot_mask(), c.resolution_mask()),
        _ => (0, 0),
    };
    let gamma = entry.gamma();
    let mut flags = 0u8;
    if entry.pinned() {
        flags |= FLAG_PINNED;
    }
    if entry.parent().is_some() {
        flags |= FLAG_PARENT;
    }
    if gamma.is_some() {
        flags |= FLAG_GAMMA;
    }

    buf.extend_from_slice(&ENTRY_MAGIC);
    buf.push(entry.level() as u8);
    buf.push(flags);
    buf.extend_from_slice(&slot_mask.to_le_bytes());
    buf.extend_from_slice(&entry.id().to_le_bytes());
    buf.extend_from_slice(&entry.strand().to_le_bytes());
    buf.extend_from_slice(&entry.created_at().to_le_bytes());
    buf.extend_from_slice(&resolution_mask.to_le_bytes());
    buf.extend_from_slice(&gamma.unwrap_or(0.0).to_le_bytes());
    buf.extend_from_slice(&entry.ref_count().to_le_bytes());
    buf.extend_from_slice(&entry.parent().unwrap_or(0).to_le_bytes());
    let body_len_pos = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    let concepts = entry.concepts();
    buf.extend_from_slice(&(concepts.len().min(u16::MAX as usize) as u16).to_le_bytes());
    buf.extend_from_slice(&[0u8; 2]);
    debug_assert_eq!(buf.len(), HEADER_SIZE);

    match entry {
        Entry::Full(f) => {
            for (index, slot) in f.filled_slots() {
                write_slot_record(&mut buf, index as u8, slot.level_mask(), slot.gamma);
                for payload in slot.levels.iter().flatten() {
                    buf.extend_from_slice(&payload.code.to_le_bytes());
                    buf.extend_from_slice(&[0u8; 2]);
                    for x in payload.vector.iter() {
                        buf.extend_from_slice(&x.to_le_bytes());
                    }
                }
            }
        }
        Entry::Compressed(c) => {
            for slot in &c.slots {
                write_slot_record(&mut buf, slot.index, slot.level_mask(), slot.gamma);
                for (nth, q) in slot.levels.iter().flatten().enumerate() {
                    buf.extend_from_slice(&q.code.to_le_bytes());
                    buf.extend_from_slice(&[0u8; 2]);
                    buf.extend_from_slice(&q.scale.to_le_bytes());
                    match quant_precision(nth) {
                        Precision::Int8 => buf.extend(q.data.iter().map(|b| *b as u8)),
                        Precision::Int4 => buf.extend(
                            q.data
                                .chunks_exact(2)
                                .map(|p| (p[0] as u8 & 0x0F) | ((p[1] as u8) << 4)),
                        ),
                    }
                }
            }
        }
        Entry::Gist(g) => {
            for x in g.summary.iter() {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        Entry::Tombstone(_) => {}
    }

    let body_len = (buf.len() - HEADER_SIZE) as u32;
    buf[body_len_pos..body_len_pos + 4].copy_from_slice(&body_len.to_le_bytes());

    for concept in concepts.iter().take(u16::MAX as usize) {
        let bytes = &concept.as_bytes()[..concept.len().min(u16::MAX as usize)];
        buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(bytes);
    }
    buf
}

fn write_slot_record(buf: &mut Vec<u8>, index: u8, level_mask: u8, gamma: f32) {
    buf.push(index);
    buf.push(level_mask);
    buf.extend_from_slice(&[0u8; 2]);
    buf.extend_from_slice(&gamma.to_le_bytes());
}

// ── Decoding ───────────────────────────────────────────────────────

/// Bounds-checked forward reader over an encoded entry.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(corrupt(format!(
                "truncated at offset {} (need {n} bytes, {} left)",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

/// Fully decode an entry (allocates). Prefer [`EntryView`] on hot paths.
pub fn decode_entry(bytes: &[u8]) -> Result<Entry> {
    let view = EntryView::new(bytes)?;
    if view.level() == DecayLevel::Tombstone {
        let mut content_hash = [0u8; 16];
        content_hash.copy_from_slice(&bytes[24..40]);
        return Ok(Entry::Tombstone(TombstoneRecord {
            id: view.id(),
            strand: view.strand(),
            content_hash,
            tombstoned_at: read_u64_at(bytes, 40),
        }));
    }

    let body_len = view.body_len();
    let mut body = Reader {
        buf: &bytes[HEADER_SIZE..HEADER_SIZE + body_len],
        pos: 0,
    };
    let mut tail = Reader {
        buf: &bytes[HEADER_SIZE + body_len..],
        pos: 0,
    };
    let concept_count = read_u16_at(bytes, 60) as usize;
    let mut concepts = Vec::with_capacity(concept_count);
    for _ in 0..concept_count {
        let len = read_u16_at(tail.take(2)?, 0) as usize;
        let raw = tail.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|e| corrupt(format!("concept utf8: {e}")))?;
        concepts.push(s.to_string());
    }

    let entry = match view.level() {
        DecayLevel::Full => {
            let mut slots: [Option<Slot>; MAX_SLOTS] = Default::default();
            while body.pos < body.buf.len() {
                let (index, level_mask, gamma) = read_slot_record(&mut body)?;
                let mut slot = Slot {
                    gamma,
                    levels: Default::default(),
                };
                for level in 0..NUM_RESOLUTIONS {
                    if level_mask & (1 << level) == 0 {
                        continue;
                    }
                    let raw = body.take(FULL_VECTOR_SIZE)?;
                    slot.levels[level] = Some(SlotPayload {
                        code: read_u16_at(raw, 0),
                        vector: Box::new(read_vector_at(raw, 4)),
                    });
                }
                slots[index] = Some(slot);
            }
            let mut frame = Frame::from_parts(view.id(), view.strand(), view.created_at(), slots);
            frame.parent = view.parent();
            frame.ref_count = view.ref_count();
            frame.pinned = view.pinned();
            frame.concepts = concepts;
            if frame.slot_mask() != view.slot_mask() || frame.resolution_mask() != view.resolution_mask() {
                return Err(corrupt(format!("frame {} masks disagree with body", view.id())));
            }
            Entry::Full(frame)
        }
        DecayLevel::Compressed => {
            let mut slots = Vec::new();
            while body.pos < body.buf.len() {
                let (index, level_mask, gamma) = read_slot_record(&mut body)?;
                if level_mask.count_ones() > 2 {
                    return Err(corrupt(format!("compressed slot {index} keeps more than two levels")));
                }
                let mut levels: [Option<QuantizedVector>; NUM_RESOLUTIONS] = Default::default();
                let mut nth = 0;
                for (level, out) in levels.iter_mut().enumerate() {
                    if level_mask & (1 << level) == 0 {
                        continue;
                    }
                    let raw = body.take(quant_vector_size(nth))?;
                    let precision = quant_precision(nth);
                    *out = Some(QuantizedVector {
                        code: read_u16_at(raw, 0),
                        scale: read_f32_at(raw, 4),
                        precision,
                        data: Box::new(read_quantized(&raw[QUANT_PREFIX_SIZE..], precision)),
                    });
                    nth += 1;
                }
                slots.push(CompressedSlot {
                    index: index as u8,
                    gamma,
                    levels,
                });
            }
            Entry::Compressed(CompressedFrame {
                id: view.id(),
                strand: view.strand(),
                created_at: view.created_at(),
                parent: view.parent(),
                ref_count: view.ref_count(),
                pinned: view.pinned(),
                concepts,
                slots,
            })
        }
        DecayLevel::Gist => {
            let raw = body.take(GIST_BODY_SIZE)?;
            Entry::Gist(GistFrame {
                id: view.id(),
                strand: view.strand(),
                created_at: view.created_at(),
                gamma: view.gamma(),
                parent: view.parent(),
                ref_count: view.ref_count(),
                pinned: view.pinned(),
                concepts,
                summary: Box::new(read_vector_at(raw, 0)),
            })
        }
        DecayLevel::Tombstone => unreachable!("handled above"),
    };
    Ok(entry)
}

fn read_quantized(raw: &[u8], precision: Precision) -> [i8; SLOT_DIM] {
    let mut out = [0i8; SLOT_DIM];
    match precision {
        Precision::Int8 => {
            for (d, b) in out.iter_mut().zip(raw.iter()) {
                *d = *b as i8;
            }
        }
        Precision::Int4 => {
            for (pair, b) in out.chunks_exact_mut(2).zip(raw.iter()) {
                let (lo, hi) = unpack_nibbles(*b);
                pair[0] = lo;
                pair[1] = hi;
            }
        }
    }
    out
}

fn read_slot_record(body: &mut Reader<'_>) -> Result<(usize, u8, f32)> {
    let raw = body.take(SLOT_RECORD_SIZE)?;
    let index = raw[0] as usize;
    if index >= MAX_SLOTS {
        return Err(corrupt(format!("slot index {index} out of range")));
    }
    Ok((index, raw[1] & 0x0F, read_f32_at(raw, 4)))
}

// ── Zero-copy view ─────────────────────────────────────────────────

/// Read-only view over an encoded entry. Header fields and individual slot
/// vectors are read straight from the underlying bytes (typically a mapped
/// run file) without decoding the whole entry.
#[derive(Clone, Copy)]
pub struct EntryView<'a> {
    bytes: &'a [u8],
    level: DecayLevel,
}

impl<'a> EntryView<'a> {
    /// Validate magic, level and lengths.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < TOMBSTONE_SIZE.min(HEADER_SIZE) || bytes[0..4] != ENTRY_MAGIC {
            return Err(corrupt("bad magic or short buffer"));
        }
        let level = DecayLevel::from_u8(bytes[4])
            .ok_or_else(|| corrupt(format!("unknown decay level {}", bytes[4])))?;
        let view = Self { bytes, level };
        if level == DecayLevel::Tombstone {
            if bytes.len() < TOMBSTONE_SIZE {
                return Err(corrupt("short tombstone"));
            }
            return Ok(view);
        }
        if bytes.len() < HEADER_SIZE || HEADER_SIZE + view.body_len() > bytes.len() {
            return Err(corrupt(format!(
                "body length {} exceeds buffer of {} bytes",
                read_u32_at(bytes, 56),
                bytes.len()
            )));
        }
        if level == DecayLevel::Gist && view.body_len() != GIST_BODY_SIZE {
            return Err(corrupt(format!("gist body of {} bytes", view.body_len())));
        }
        Ok(view)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn level(&self) -> DecayLevel {
        self.level
    }

    pub fn id(&self) -> FrameId {
        read_u64_at(self.bytes, 8)
    }

    pub fn strand(&self) -> StrandId {
        read_u64_at(self.bytes, 16)
    }

    pub fn created_at(&self) -> u64 {
        match self.level {
            DecayLevel::Tombstone => read_u64_at(self.bytes, 40),
            _ => read_u64_at(self.bytes, 24),
        }
    }

    fn flags(&self) -> u8 {
        match self.level {
            DecayLevel::Tombstone => 0,
            _ => self.bytes[5],
        }
    }

    pub fn pinned(&self) -> bool {
        self.flags() & FLAG_PINNED != 0
    }

    pub fn gamma(&self) -> Option<f32> {
        (self.flags() & FLAG_GAMMA != 0).then(|| read_f32_at(self.bytes, 40))
    }

    pub fn parent(&self) -> Option<FrameId> {
        (self.flags() & FLAG_PARENT != 0).then(|| read_u64_at(self.bytes, 48))
    }

    pub fn ref_count(&self) -> u32 {
        match self.level {
            DecayLevel::Tombstone => 0,
            _ => read_u32_at(self.bytes, 44),
        }
    }

    pub fn slot_mask(&self) -> u16 {
        match self.level {
            DecayLevel::Tombstone => 0,
            _ => read_u16_at(self.bytes, 6),
        }
    }

    pub fn resolution_mask(&self) -> u64 {
        match self.level {
            DecayLevel::Tombstone => 0,
            _ => read_u64_at(self.bytes, 32),
        }
    }

    fn body_len(&self) -> usize {
        read_u32_at(self.bytes, 56) as usize
    }

    /// One slot vector, dequantized for compressed entries.
    pub fn slot_vector(&self, slot: usize, level: usize) -> Option<[f32; SLOT_DIM]> {
        if !matches!(self.level, DecayLevel::Full | DecayLevel::Compressed) {
            return None;
        }
        if slot >= MAX_SLOTS || level >= NUM_RESOLUTIONS {
            return None;
        }
        let end = HEADER_SIZE + self.body_len();
        let mut pos = HEADER_SIZE;
        while pos + SLOT_RECORD_SIZE <= end {
            let index = self.bytes[pos] as usize;
            let mask = self.bytes[pos + 1] & 0x0F;
            pos += SLOT_RECORD_SIZE;
            let slot_body = match self.level {
                DecayLevel::Full => mask.count_ones() as usize * FULL_VECTOR_SIZE,
                _ => compressed_slot_body(mask),
            };
            if index != slot {
                pos += slot_body;
                continue;
            }
            if mask & (1 << level) == 0 {
                return None;
            }
            let before = (mask & ((1u8 << level) - 1)).count_ones() as usize;
            return match self.level {
                DecayLevel::Full => {
                    let at = pos + before * FULL_VECTOR_SIZE;
                    (at + FULL_VECTOR_SIZE <= end).then(|| read_vector_at(self.bytes, at + 4))
                }
                _ => {
                    let at = pos + compressed_slot_body(mask & ((1u8 << level) - 1));
                    let size = quant_vector_size(before);
                    if before > 1 || at + size > end {
                        return None;
                    }
                    let scale = read_f32_at(self.bytes, at + 4);
                    let data = read_quantized(&self.bytes[at + QUANT_PREFIX_SIZE..at + size], quant_precision(before));
                    let mut out = [0.0f32; SLOT_DIM];
                    for (o, q) in out.iter_mut().zip(data.iter()) {
                        *o = *q as f32 * scale;
                    }
                    Some(out)
                }
            };
        }
        None
    }

    /// Frame summary vector; read directly for gists.
    pub fn summary(&self) -> Option<[f32; SLOT_DIM]> {
        match self.level {
            DecayLevel::Tombstone => None,
            DecayLevel::Gist => Some(read_vector_at(self.bytes, HEADER_SIZE)),
            _ => {
                let mut acc = [0.0f32; SLOT_DIM];
                let mut any = false;
                let mask = self.resolution_mask();
                for slot in 0..MAX_SLOTS {
                    let bits = (mask >> (slot * NUM_RESOLUTIONS)) & 0xF;
                    if bits == 0 {
                        continue;
                    }
                    let level = bits.trailing_zeros() as usize;
                    if let Some(v) = self.slot_vector(slot, level) {
                        for (a, x) in acc.iter_mut().zip(v.iter()) {
                            *a += x;
                        }
                        any = true;
                    }
                }
                (any && super::l2_normalize(&mut acc)).then_some(acc)
            }
        }
    }

    pub fn to_entry(&self) -> Result<Entry> {
        decode_entry(self.bytes)
    }
}

impl std::fmt::Debug for EntryView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryView")
            .field("id", &self.id())
            .field("level", &self.level)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Re-expand a compressed entry into a lossy full frame (used by recall
/// when a caller asks for full-width vectors of a demoted entry).
pub fn inflate(entry: &Entry) -> Option<Frame> {
    match entry {
        Entry::Full(f) => Some(f.clone()),
        Entry::Compressed(c) => {
            let mut frame = Frame::from_parts(c.id, c.strand, c.created_at, expand_compressed(c));
            frame.parent = c.parent;
            frame.ref_count = c.ref_count;
            frame.pinned = c.pinned;
            frame.concepts = c.concepts.clone();
            Some(frame)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::cosine_similarity;

    fn ramp(seed: usize) -> [f32; SLOT_DIM] {
        let mut v = [0.0f32; SLOT_DIM];
        for (i, x) in v.iter_mut().enumerate() {
            *x = (((i * 7 + seed) % 23) as f32 - 11.0) / 11.0;
        }
        v
    }

    fn sample_frame() -> Frame {
        let mut frame = Frame::new("physics");
        frame.id = 77;
        frame.parent = Some(12);
        frame.ref_count = 3;
        frame.concepts = vec!["gravity".into(), "orbit".into()];
        frame.fill_slot(1, 0.9, &[(0, ramp(1)), (2, ramp(2))]).unwrap();
        frame.fill_slot(9, 0.5, &[(0, ramp(3)), (1, ramp(4)), (3, ramp(5))]).unwrap();
        frame
    }

    #[test]
    fn test_full_entry_decodes_identically() {
        let entry = Entry::Full(sample_frame());
        let bytes = encode_entry(&entry);
        assert_eq!(bytes.len(), encoded_len(&entry));
        assert_eq!(decode_entry(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_every_level_matches_encoded_len() {
        let full = Entry::Full(sample_frame());
        for target in [DecayLevel::Compressed, DecayLevel::Gist, DecayLevel::Tombstone] {
            let e = full.degrade(target, 5).unwrap();
            let bytes = encode_entry(&e);
            assert_eq!(bytes.len(), encoded_len(&e), "{target:?}");
            assert_eq!(decode_entry(&bytes).unwrap(), e, "{target:?}");
        }
        let tomb = full.degrade(DecayLevel::Tombstone, 5).unwrap();
        assert_eq!(tomb.byte_size(), TOMBSTONE_SIZE as u64);
    }

    #[test]
    fn test_view_reads_header_without_decoding() {
        let frame = sample_frame();
        let bytes = encode_entry(&Entry::Full(frame.clone()));
        let view = EntryView::new(&bytes).unwrap();
        assert_eq!(view.level(), DecayLevel::Full);
        assert_eq!(view.id(), 77);
        assert_eq!(view.strand(), frame.strand);
        assert_eq!(view.gamma(), Some(0.5));
        assert_eq!(view.parent(), Some(12));
        assert_eq!(view.ref_count(), 3);
        assert!(!view.pinned());
        assert_eq!(view.slot_mask(), frame.slot_mask());
        assert_eq!(view.resolution_mask(), frame.resolution_mask());
    }

    #[test]
    fn test_view_slot_vector_lookup() {
        let frame = sample_frame();
        let bytes = encode_entry(&Entry::Full(frame));
        let view = EntryView::new(&bytes).unwrap();
        assert_eq!(view.slot_vector(9, 3).unwrap(), ramp(5));
        assert_eq!(view.slot_vector(1, 2).unwrap(), ramp(2));
        assert!(view.slot_vector(1, 1).is_none());
        assert!(view.slot_vector(4, 0).is_none());
        assert!(view.slot_vector(16, 0).is_none());
    }

    #[test]
    fn test_view_summary_matches_entry() {
        let entry = Entry::Full(sample_frame());
        let bytes = encode_entry(&entry);
        let view = EntryView::new(&bytes).unwrap();
        let a = view.summary().unwrap();
        let b = entry.summary_vector().unwrap();
        assert!(cosine_similarity(&a, &b) > 0.9999);

        let compressed = entry.degrade(DecayLevel::Compressed, 0).unwrap();
        let cbytes = encode_entry(&compressed);
        let cview = EntryView::new(&cbytes).unwrap();
        assert!(cosine_similarity(&cview.summary().unwrap(), &b) > 0.99);
        let v = cview.slot_vector(9, 1).unwrap();
        assert!(cosine_similarity(&v, &ramp(4)) > 0.99);
    }

    #[test]
    fn test_rejects_damaged_bytes() {
        let bytes = encode_entry(&Entry::Full(sample_frame()));
        assert!(EntryView::new(&bytes[..10]).is_err());
        assert!(decode_entry(&bytes[..bytes.len() - 3]).is_err());

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(decode_entry(&bad).is_err());

        let mut bad_level = bytes.clone();
        bad_level[4] = 9;
        assert!(decode_entry(&bad_level).is_err());
    }

    #[test]
    fn test_dense_compressed_entry_fits_8k() {
        let mut frame = Frame::new("dense");
        frame.id = 3;
        for slot in 0..MAX_SLOTS {
            let levels: Vec<_> = (0..NUM_RESOLUTIONS).map(|l| (l, ramp(slot + l))).collect();
            frame.fill_slot(slot, 0.7, &levels).unwrap();
        }
        let compressed = Entry::Full(frame).degrade(DecayLevel::Compressed, 0).unwrap();
        let bytes = encode_entry(&compressed);
        assert_eq!(bytes.len(), encoded_len(&compressed));
        assert_eq!(bytes.len(), HEADER_SIZE + MAX_SLOTS * (SLOT_RECORD_SIZE + QUANT8_VECTOR_SIZE + QUANT4_VECTOR_SIZE));
        assert!(bytes.len() <= 8 * 1024);
        assert_eq!(decode_entry(&bytes).unwrap(), compressed);

        let view = EntryView::new(&bytes).unwrap();
        let fine = view.slot_vector(15, 1).unwrap();
        assert!(cosine_similarity(&fine, &ramp(16)) > 0.99);
        assert!(view.slot_vector(15, 2).is_none());
    }

    #[test]
    fn test_nibbles_sign_extend() {
        assert_eq!(unpack_nibbles(0x00), (0, 0));
        assert_eq!(unpack_nibbles(0x7F), (-1, 7));
        assert_eq!(unpack_nibbles(0x89), (-7, -8));
    }

    #[test]
    fn test_short_gist_body_is_corrupt() {
        let gist = Entry::Full(sample_frame()).degrade(DecayLevel::Gist, 0).unwrap();
        let bytes = encode_entry(&gist);
        let mut short = bytes[..HEADER_SIZE + 16].to_vec();
        short[56..60].copy_from_slice(&16u32.to_le_bytes());
        short[60..62].copy_from_slice(&0u16.to_le_bytes());
        assert!(matches!(EntryView::new(&short), Err(VoltError::Corrupt { .. })));
        assert!(decode_entry(&short).is_err());
        assert!(EntryView::new(&bytes).unwrap().summary().is_some());
    }

    #[test]
    fn test_inflate_compressed() {
        let entry = Entry::Full(sample_frame());
        let compressed = entry.degrade(DecayLevel::Compressed, 0).unwrap();
        let frame = inflate(&compressed).unwrap();
        assert_eq!(frame.slot_mask(), sample_frame().slot_mask());
        assert!(frame.has_resolution(9, 0));
        assert!(frame.has_resolution(9, 1));
        assert!(!frame.has_resolution(9, 3));
        assert!(inflate(&entry.degrade(DecayLevel::Gist, 0).unwrap()).is_none());
    }
}
