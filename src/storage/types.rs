//! On-disk format types shared by the WAL, sorted runs and the engine.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoltError};
use crate::frame::{codec::read_u64_at, FrameId, StrandId};

// ── Constants ──────────────────────────────────────────────────────

/// WAL file magic.
pub const WAL_MAGIC: [u8; 4] = *b"VXWL";
/// Per-record marker; replay resynchronises on it after damage.
pub const RECORD_MAGIC: [u8; 4] = *b"VREC";
pub const WAL_VERSION: u16 = 1;
pub const WAL_HEADER_SIZE: usize = 24;
/// magic(4) + body_len(4)
pub const RECORD_PREFIX_SIZE: usize = 8;
/// seq(8) + op(1) + frame id(8)
pub const RECORD_FIXED_BODY: usize = 17;
pub const RECORD_CHECKSUM_SIZE: usize = 8;

/// Sorted run magic.
pub const RUN_MAGIC: [u8; 4] = *b"VXSR";
pub const RUN_FOOTER_MAGIC: u32 = 0x5658_5346; // "VXSF"
pub const RUN_VERSION: u16 = 1;
pub const RUN_HEADER_SIZE: usize = 32;
pub const RUN_FOOTER_SIZE: usize = 32;
pub const RUN_KEY_SIZE: usize = 48;
/// Level byte of a delete marker in the run key table.
pub const DELETED_LEVEL: u8 = 0xFF;

/// First 8 bytes of BLAKE3, little-endian.
pub fn checksum64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(blake3::hash(bytes).as_bytes()[0..8].try_into().unwrap())
}

// ── WAL ops ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalOp {
    /// Payload: encoded full entry.
    Store = 1,
    /// Payload: encoded lower-resolution entry.
    Degrade = 2,
    Pin = 3,
    Unpin = 4,
    /// Tombstone-free removal of every version.
    Delete = 5,
    /// Payload: bincode [`MetadataPatch`].
    Annotate = 6,
}

impl WalOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WalOp::Store),
            2 => Some(WalOp::Degrade),
            3 => Some(WalOp::Pin),
            4 => Some(WalOp::Unpin),
            5 => Some(WalOp::Delete),
            6 => Some(WalOp::Annotate),
            _ => None,
        }
    }
}

/// Metadata-only change applied on top of the newest version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub ref_count: Option<u32>,
    pub pinned: Option<bool>,
    /// Set only; a patch never clears a parent link.
    pub parent: Option<FrameId>,
}

impl MetadataPatch {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A durable WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub strand: StrandId,
    pub seq: u64,
    pub op: WalOp,
    pub frame_id: FrameId,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// `VREC | body_len | seq | op | frame id | payload | checksum`.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = RECORD_FIXED_BODY + self.payload.len();
        let mut buf = Vec::with_capacity(RECORD_PREFIX_SIZE + body_len + RECORD_CHECKSUM_SIZE);
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.push(self.op as u8);
        buf.extend_from_slice(&self.frame_id.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        let sum = checksum64(&buf[RECORD_PREFIX_SIZE..]);
        buf.extend_from_slice(&sum.to_le_bytes());
        buf
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_PREFIX_SIZE + RECORD_FIXED_BODY + self.payload.len() + RECORD_CHECKSUM_SIZE
    }
}

// ── WAL header ─────────────────────────────────────────────────────

/// WAL file header, 24 bytes.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"VXWL"
/// 4       2     version: u16
/// 6       2     reserved
/// 8       8     strand id: u64
/// 16      8     base seq: u64 (records at or below are checkpointed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub strand: StrandId,
    pub base_seq: u64,
}

impl WalHeader {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&WAL_MAGIC)?;
        writer.write_all(&WAL_VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.strand.to_le_bytes())?;
        writer.write_all(&self.base_seq.to_le_bytes())?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WAL_HEADER_SIZE || bytes[0..4] != WAL_MAGIC {
            return Err(VoltError::InvalidFormat("Not a WAL file".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != WAL_VERSION {
            return Err(VoltError::InvalidFormat(format!("Unsupported WAL version: {version}")));
        }
        Ok(Self {
            strand: read_u64_at(bytes, 8),
            base_seq: read_u64_at(bytes, 16),
        })
    }
}

// ── Run header ─────────────────────────────────────────────────────

/// Sorted run header, 32 bytes.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"VXSR"
/// 4       2     version: u16
/// 6       2     reserved
/// 8       8     entry count: u64
/// 16      8     footer offset: u64
/// 24      8     max epoch: u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHeader {
    pub entry_count: u64,
    pub footer_offset: u64,
    pub max_epoch: u64,
}

impl RunHeader {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&RUN_MAGIC)?;
        writer.write_all(&RUN_VERSION.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.entry_count.to_le_bytes())?;
        writer.write_all(&self.footer_offset.to_le_bytes())?;
        writer.write_all(&self.max_epoch.to_le_bytes())?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RUN_HEADER_SIZE {
            return Err(VoltError::InvalidFormat("File too small for sorted run".into()));
        }
        if bytes[0..4] != RUN_MAGIC {
            return Err(VoltError::InvalidFormat(format!(
                "Not a sorted run: expected VXSR, got {:?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != RUN_VERSION {
            return Err(VoltError::InvalidFormat(format!("Unsupported run version: {version}")));
        }
        Ok(Self {
            entry_count: read_u64_at(bytes, 8),
            footer_offset: read_u64_at(bytes, 16),
            max_epoch: read_u64_at(bytes, 24),
        })
    }
}

// ── Run footer ─────────────────────────────────────────────────────

/// Last 32 bytes of a run.
///
/// ```text
/// +0   8  bloom offset
/// +8   8  key table offset
/// +16  8  data offset
/// +24  4  reserved
/// +28  4  magic: "VXSF"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFooter {
    pub bloom_offset: u64,
    pub index_offset: u64,
    pub data_offset: u64,
}

impl RunFooter {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.bloom_offset.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.data_offset.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&RUN_FOOTER_MAGIC.to_le_bytes())?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RUN_FOOTER_SIZE {
            return Err(VoltError::InvalidFormat("Run footer too small".into()));
        }
        let magic = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
        if magic != RUN_FOOTER_MAGIC {
            return Err(VoltError::InvalidFormat(format!("Invalid run footer magic: {magic:#x}")));
        }
        Ok(Self {
            bloom_offset: read_u64_at(bytes, 0),
            index_offset: read_u64_at(bytes, 8),
            data_offset: read_u64_at(bytes, 16),
        })
    }
}

// ── Run key ────────────────────────────────────────────────────────

/// Key table row, 48 bytes. Rows are sorted by `(frame_id, epoch)`.
///
/// ```text
/// +0   8  frame id
/// +8   8  created_at
/// +16  1  decay level (0xFF = delete marker)
/// +17  7  reserved
/// +24  8  epoch
/// +32  8  blob offset (absolute)
/// +40  4  blob length
/// +44  4  reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunKey {
    pub frame_id: FrameId,
    pub created_at: u64,
    pub level: u8,
    pub epoch: u64,
    pub offset: u64,
    pub len: u32,
}

impl RunKey {
    pub fn is_delete(&self) -> bool {
        self.level == DELETED_LEVEL
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.frame_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        writer.write_all(&[self.level])?;
        writer.write_all(&[0u8; 7])?;
        writer.write_all(&self.epoch.to_le_bytes())?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.len.to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Caller guarantees `bytes.len() >= RUN_KEY_SIZE`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            frame_id: read_u64_at(bytes, 0),
            created_at: read_u64_at(bytes, 8),
            level: bytes[16],
            epoch: read_u64_at(bytes, 24),
            offset: read_u64_at(bytes, 32),
            len: u32::from_le_bytes(bytes[40..44].try_into().unwrap()),
        }
    }
}
