//! Shared quantization codebook.
//!
//! A fixed table of unit vectors (65,536 × 256 in production) loaded once at
//! startup and shared read-only by every component. A missing or damaged
//! codebook is the one fatal startup condition.
//!
//! Blob layout:
//!
//! ```text
//! Offset  Size      Field
//! 0       4         magic: b"VXCB"
//! 4       4         version: u32 = 1
//! 8       4         entry count: u32
//! 12      4         dimension: u32 = 256
//! 16      count×1K  entries, f32 little-endian, row-major
//! end-8   8         checksum: first 8 bytes of BLAKE3 over header + entries
//! ```

use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use rayon::prelude::*;
use tracing::info;

use crate::error::{Result, VoltError};
use crate::frame::{cosine_similarity, l2_normalize, SLOT_DIM};

// ── Constants ──────────────────────────────────────────────────────

pub const CODEBOOK_MAGIC: [u8; 4] = *b"VXCB";
pub const CODEBOOK_VERSION: u32 = 1;
/// Production table size; one `u16` code per entry.
pub const CODEBOOK_CAPACITY: usize = 65_536;
const HEADER_SIZE: usize = 16;
const CHECKSUM_SIZE: usize = 8;
/// Tables at least this large are searched with rayon.
const PARALLEL_THRESHOLD: usize = 4096;
/// Allowed deviation from unit norm on load.
const NORM_TOLERANCE: f32 = 1e-3;

fn codebook_err(detail: impl Into<String>) -> VoltError {
    VoltError::Codebook(detail.into())
}

// ── Codebook ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Codebook {
    /// Row-major `len × SLOT_DIM` unit vectors.
    data: Vec<f32>,
    len: usize,
}

impl Codebook {
    /// Build from raw vectors, normalizing each. Zero vectors are rejected.
    pub fn from_vectors(vectors: Vec<[f32; SLOT_DIM]>) -> Result<Self> {
        if vectors.is_empty() || vectors.len() > CODEBOOK_CAPACITY {
            return Err(codebook_err(format!(
                "entry count {} outside 1..={CODEBOOK_CAPACITY}",
                vectors.len()
            )));
        }
        let len = vectors.len();
        let mut data = Vec::with_capacity(len * SLOT_DIM);
        for (i, mut v) in vectors.into_iter().enumerate() {
            if !l2_normalize(&mut v) {
                return Err(codebook_err(format!("entry {i} is a zero vector")));
            }
            data.extend_from_slice(&v);
        }
        Ok(Self { data, len })
    }

    /// Deterministic pseudo-random table (Gaussian directions, normalized).
    pub fn generate(len: usize, seed: u64) -> Result<Self> {
        let mut rng = SplitMix64(seed);
        let mut vectors = Vec::with_capacity(len);
        for _ in 0..len {
            let mut v = [0.0f32; SLOT_DIM];
            for pair in v.chunks_mut(2) {
                let (a, b) = rng.gaussian_pair();
                pair[0] = a;
                if pair.len() > 1 {
                    pair[1] = b;
                }
            }
            vectors.push(v);
        }
        Self::from_vectors(vectors)
    }

    /// Load and validate a blob. Any failure is `VoltError::Codebook`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| codebook_err(format!("cannot open {}: {e}", path.display())))?;
        // SAFETY: the blob is read-only for the process lifetime.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| codebook_err(format!("cannot map {}: {e}", path.display())))?;
        let codebook = Self::from_bytes(&mmap)?;
        info!(path = %path.display(), entries = codebook.len, "codebook loaded");
        Ok(codebook)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(codebook_err(format!("blob too short ({} bytes)", bytes.len())));
        }
        if bytes[0..4] != CODEBOOK_MAGIC {
            return Err(codebook_err("bad magic"));
        }
        let word = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let version = word(4);
        if version != CODEBOOK_VERSION {
            return Err(codebook_err(format!("unsupported version {version}")));
        }
        let len = word(8) as usize;
        let dim = word(12) as usize;
        if dim != SLOT_DIM {
            return Err(codebook_err(format!("dimension {dim}, expected {SLOT_DIM}")));
        }
        if len == 0 || len > CODEBOOK_CAPACITY {
            return Err(codebook_err(format!("entry count {len} outside 1..={CODEBOOK_CAPACITY}")));
        }
        let body_end = HEADER_SIZE + len * SLOT_DIM * 4;
        if bytes.len() != body_end + CHECKSUM_SIZE {
            return Err(codebook_err(format!(
                "size {} does not match {len} entries",
                bytes.len()
            )));
        }
        let stored = u64::from_le_bytes(bytes[body_end..].try_into().unwrap());
        if stored != checksum(&bytes[..body_end]) {
            return Err(codebook_err("checksum mismatch"));
        }

        let data: Vec<f32> = bytes[HEADER_SIZE..body_end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        for (i, row) in data.chunks_exact(SLOT_DIM).enumerate() {
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if !norm.is_finite() || (norm - 1.0).abs() > NORM_TOLERANCE {
                return Err(codebook_err(format!("entry {i} has norm {norm}")));
            }
        }
        Ok(Self { data, len })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len() * 4 + CHECKSUM_SIZE);
        buf.extend_from_slice(&CODEBOOK_MAGIC);
        buf.extend_from_slice(&CODEBOOK_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.len as u32).to_le_bytes());
        buf.extend_from_slice(&(SLOT_DIM as u32).to_le_bytes());
        for x in &self.data {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        let sum = checksum(&buf);
        buf.extend_from_slice(&sum.to_le_bytes());
        buf
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.to_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entry(&self, code: u16) -> Option<&[f32]> {
        let i = code as usize;
        (i < self.len).then(|| &self.data[i * SLOT_DIM..(i + 1) * SLOT_DIM])
    }

    /// Nearest entry by cosine similarity: `(code, similarity)`.
    /// Ties resolve to the lower code.
    pub fn quantize(&self, vector: &[f32; SLOT_DIM]) -> (u16, f32) {
        let score = |(i, row): (usize, &[f32])| (i, cosine_similarity(row, vector));
        let better = |a: (usize, f32), b: (usize, f32)| {
            if b.1 > a.1 || (b.1 == a.1 && b.0 < a.0) {
                b
            } else {
                a
            }
        };
        let (best, sim) = if self.len >= PARALLEL_THRESHOLD {
            self.data
                .par_chunks_exact(SLOT_DIM)
                .enumerate()
                .map(score)
                .reduce(|| (usize::MAX, f32::NEG_INFINITY), better)
        } else {
            self.data
                .chunks_exact(SLOT_DIM)
                .enumerate()
                .map(score)
                .fold((usize::MAX, f32::NEG_INFINITY), better)
        };
        (best as u16, sim)
    }

    /// New table with the given entries replaced (and normalized). The
    /// current table is left untouched for readers still holding it.
    pub fn recentered(&self, updates: &[(u16, [f32; SLOT_DIM])]) -> Result<Self> {
        let mut next = self.clone();
        for (code, vector) in updates {
            let i = *code as usize;
            if i >= self.len {
                return Err(codebook_err(format!("code {code} beyond {} entries", self.len)));
            }
            let mut v = *vector;
            if !l2_normalize(&mut v) {
                return Err(codebook_err(format!("replacement for code {code} is a zero vector")));
            }
            next.data[i * SLOT_DIM..(i + 1) * SLOT_DIM].copy_from_slice(&v);
        }
        Ok(next)
    }
}

fn checksum(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(blake3::hash(bytes).as_bytes()[0..8].try_into().unwrap())
}

/// SplitMix64 PRNG; enough for reproducible codebooks.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in (0, 1].
    fn unit(&mut self) -> f64 {
        ((self.next_u64() >> 11) as f64 + 1.0) / (1u64 << 53) as f64
    }

    /// Box-Muller.
    fn gaussian_pair(&mut self) -> (f32, f32) {
        let r = (-2.0 * self.unit().ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * self.unit();
        ((r * theta.cos()) as f32, (r * theta.sin()) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_is_deterministic_and_unit() {
        let a = Codebook::generate(64, 7).unwrap();
        let b = Codebook::generate(64, 7).unwrap();
        assert_eq!(a.data, b.data);
        let c = Codebook::generate(64, 8).unwrap();
        assert_ne!(a.data, c.data);
        for code in 0..64u16 {
            let row = a.entry(code).unwrap();
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        assert!(a.entry(64).is_none());
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("codebook.bin");
        let cb = Codebook::generate(32, 1).unwrap();
        cb.save(&path).unwrap();
        let loaded = Codebook::load(&path).unwrap();
        assert_eq!(loaded.len(), 32);
        assert_eq!(loaded.data, cb.data);
    }

    #[test]
    fn test_missing_or_damaged_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = Codebook::load(&dir.path().join("nope.bin")).unwrap_err();
        assert!(err.is_fatal());

        let mut bytes = Codebook::generate(4, 1).unwrap().to_bytes();
        bytes[HEADER_SIZE + 10] ^= 0xFF;
        let err = Codebook::from_bytes(&bytes).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("checksum"));

        let bytes = Codebook::generate(4, 1).unwrap().to_bytes();
        assert!(Codebook::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_quantize_finds_own_entry() {
        let cb = Codebook::generate(128, 3).unwrap();
        for code in [0u16, 17, 127] {
            let v: [f32; SLOT_DIM] = cb.entry(code).unwrap().try_into().unwrap();
            let (found, sim) = cb.quantize(&v);
            assert_eq!(found, code);
            assert!(sim > 0.999);
        }
    }

    #[test]
    fn test_parallel_search_agrees_with_sequential() {
        let cb = Codebook::generate(PARALLEL_THRESHOLD, 11).unwrap();
        let v: [f32; SLOT_DIM] = cb.entry(4000).unwrap().try_into().unwrap();
        assert_eq!(cb.quantize(&v).0, 4000);
    }

    #[test]
    fn test_recentered_leaves_original() {
        let cb = Codebook::generate(8, 5).unwrap();
        let mut target = [0.0f32; SLOT_DIM];
        target[0] = 2.0;
        let next = cb.recentered(&[(3, target)]).unwrap();
        assert_eq!(next.entry(3).unwrap()[0], 1.0);
        assert_ne!(cb.entry(3).unwrap()[0], 1.0);
        assert!(cb.recentered(&[(8, target)]).is_err());
        assert!(cb.recentered(&[(0, [0.0; SLOT_DIM])]).is_err());
    }
}
