//! Bloom filter over frame ids with enhanced double-hashing.
//!
//! Frame ids are sequential, so each key is first spread with two 64-bit
//! finalizers to produce independent halves (h1, h2). Probe `i` is
//! `h1 + i·h2 mod bits`.
//!
//! Binary format:
//! ```text
//! [num_bits: u64 LE]           // 8 bytes
//! [num_hashes: u32 LE]         // 4 bytes
//! [padding: u32 LE = 0]        // 4 bytes
//! [bits: u64 LE x word_count]  // word_count = ceil(num_bits / 64)
//! ```

use std::io::Write;

use crate::error::{Result, VoltError};
use crate::frame::FrameId;

/// 10 bits per key gives ~0.82% FPR with 7 probes.
pub const BLOOM_BITS_PER_KEY: usize = 10;
pub const BLOOM_NUM_HASHES: usize = 7;

const BLOOM_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

#[inline]
pub(crate) fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn probe_positions(key: FrameId, num_hashes: usize, num_bits: usize) -> impl Iterator<Item = usize> {
    let h1 = mix64(key);
    // odd h2 is coprime with any power-of-two bit count
    let h2 = mix64(key ^ 0x9E37_79B9_7F4A_7C15) | 1;
    (0..num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % (num_bits as u64)) as usize)
}

impl BloomFilter {
    /// Sized for `num_keys` insertions; word-aligned, minimum 64 bits.
    pub fn new(num_keys: usize) -> Self {
        let raw_bits = num_keys.saturating_mul(BLOOM_BITS_PER_KEY);
        let num_bits = (raw_bits.max(64) + 63) & !63;
        Self {
            bits: vec![0u64; num_bits / 64],
            num_bits,
            num_hashes: BLOOM_NUM_HASHES,
        }
    }

    pub fn insert(&mut self, key: FrameId) {
        for pos in probe_positions(key, self.num_hashes, self.num_bits) {
            self.bits[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    /// `false` → definitely absent. `true` → probably present.
    pub fn maybe_contains(&self, key: FrameId) -> bool {
        probe_positions(key, self.num_hashes, self.num_bits)
            .all(|pos| self.bits[pos / 64] & (1u64 << (pos % 64)) != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.num_bits as u64).to_le_bytes())?;
        writer.write_all(&(self.num_hashes as u32).to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        for &word in &self.bits {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOOM_HEADER_SIZE {
            return Err(VoltError::InvalidFormat("Bloom filter too small".into()));
        }
        let num_bits = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let num_hashes = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        if num_bits == 0 || num_hashes == 0 {
            return Err(VoltError::InvalidFormat("Bloom filter has zero bits".into()));
        }
        let word_count = num_bits.div_ceil(64);
        if bytes.len() < BLOOM_HEADER_SIZE + word_count * 8 {
            return Err(VoltError::InvalidFormat("Bloom filter data truncated".into()));
        }
        let bits = bytes[BLOOM_HEADER_SIZE..BLOOM_HEADER_SIZE + word_count * 8]
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .collect();
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    pub fn serialized_size(&self) -> usize {
        BLOOM_HEADER_SIZE + self.bits.len() * 8
    }
}
