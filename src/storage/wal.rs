//! Per-strand write-ahead log.
//!
//! Every mutation is appended here before it touches the memtable. Replay
//! is tolerant: a record whose checksum does not match is skipped (and
//! logged) by scanning forward to the next `VREC` marker, a torn tail ends
//! replay, and records whose sequence does not advance are ignored.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::types::{
    checksum64, WalHeader, WalOp, WalRecord, RECORD_CHECKSUM_SIZE, RECORD_FIXED_BODY,
    RECORD_MAGIC, RECORD_PREFIX_SIZE, WAL_HEADER_SIZE,
};
use crate::error::Result;
use crate::frame::{codec::read_u64_at, FrameId, StrandId};

/// Outcome of reading a WAL file.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Intact records above the base sequence, in order.
    pub records: Vec<WalRecord>,
    /// Damaged records skipped.
    pub skipped: usize,
    /// The file ended inside a record.
    pub truncated_tail: bool,
    /// Offset just past the last intact record.
    pub valid_end: usize,
}

fn find_magic(bytes: &[u8], from: usize) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(RECORD_MAGIC.len())
        .position(|w| w == RECORD_MAGIC)
        .map(|p| p + from)
}

/// Parse every record after the header. `base_seq` is the checkpoint:
/// records at or below it are already in a sorted run.
pub fn read_records(bytes: &[u8], strand: StrandId, base_seq: u64) -> WalReplay {
    let mut out = WalReplay {
        valid_end: WAL_HEADER_SIZE.min(bytes.len()),
        ..Default::default()
    };
    let mut last_seq = base_seq;
    let mut pos = WAL_HEADER_SIZE;

    while pos < bytes.len() {
        let resync = |out: &mut WalReplay, at: usize, reason: &str| -> Option<usize> {
            match find_magic(bytes, at + 1) {
                Some(next) => {
                    warn!(strand = format_args!("{strand:016x}"), offset = at, reason, "skipping damaged WAL record");
                    out.skipped += 1;
                    Some(next)
                }
                None => {
                    out.truncated_tail = true;
                    None
                }
            }
        };

        if bytes.len() - pos < RECORD_PREFIX_SIZE || bytes[pos..pos + 4] != RECORD_MAGIC {
            match resync(&mut out, pos, "missing record marker") {
                Some(next) => {
                    pos = next;
                    continue;
                }
                None => break,
            }
        }

        let body_len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body_start = pos + RECORD_PREFIX_SIZE;
        let end = body_start + body_len + RECORD_CHECKSUM_SIZE;
        if body_len < RECORD_FIXED_BODY || end > bytes.len() {
            match resync(&mut out, pos, "bad record length") {
                Some(next) => {
                    pos = next;
                    continue;
                }
                None => break,
            }
        }

        let body = &bytes[body_start..body_start + body_len];
        let stored = read_u64_at(bytes, body_start + body_len);
        let seq = read_u64_at(body, 0);
        let op = WalOp::from_u8(body[8]);
        if stored != checksum64(body) || op.is_none() {
            warn!(
                strand = format_args!("{strand:016x}"),
                offset = pos,
                seq,
                "WAL checksum mismatch, record skipped"
            );
            out.skipped += 1;
            match find_magic(bytes, pos + 1) {
                Some(next) => {
                    pos = next;
                    continue;
                }
                None => break,
            }
        }

        pos = end;
        out.valid_end = end;
        if seq <= last_seq {
            debug!(strand = format_args!("{strand:016x}"), seq, last_seq, "ignoring stale WAL record");
            continue;
        }
        last_seq = seq;
        out.records.push(WalRecord {
            strand,
            seq,
            op: op.unwrap_or(WalOp::Store),
            frame_id: read_u64_at(body, 9) as FrameId,
            payload: body[RECORD_FIXED_BODY..].to_vec(),
        });
    }
    out
}

// ── Wal ────────────────────────────────────────────────────────────

/// Append handle for one strand's log.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    strand: StrandId,
    base_seq: u64,
    next_seq: u64,
    sync: bool,
}

impl Wal {
    pub fn path_for(dir: &Path, strand: StrandId) -> PathBuf {
        dir.join(format!("strand_{strand:016x}.wal"))
    }

    /// Create a fresh log (truncating any existing file).
    pub fn create(dir: &Path, strand: StrandId, base_seq: u64, sync: bool) -> Result<Self> {
        let path = Self::path_for(dir, strand);
        write_file(&path, &WalHeader { strand, base_seq }, &[])?;
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            strand,
            base_seq,
            next_seq: base_seq + 1,
            sync,
        })
    }

    /// Open an existing log and read it. `checkpoint` (from the manifest)
    /// overrides a stale header base sequence. A torn tail is cut off so
    /// later appends start on a clean boundary.
    pub fn open(path: &Path, checkpoint: Option<u64>, sync: bool) -> Result<(Self, WalReplay)> {
        let bytes = fs::read(path)?;
        let header = WalHeader::from_bytes(&bytes)?;
        let base_seq = header.base_seq.max(checkpoint.unwrap_or(0));
        let replay = read_records(&bytes, header.strand, base_seq);

        if replay.truncated_tail {
            warn!(
                path = %path.display(),
                valid_end = replay.valid_end,
                len = bytes.len(),
                "WAL ends inside a record, truncating tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_end as u64)?;
            file.sync_all()?;
        }

        let last = replay.records.last().map(|r| r.seq).unwrap_or(0);
        // Sequences never move backwards, even past skipped or stale records.
        let max_seen = max_seq_in(&bytes[..replay.valid_end.min(bytes.len())]).max(last);
        let file = OpenOptions::new().append(true).open(path)?;
        let wal = Self {
            path: path.to_path_buf(),
            file,
            strand: header.strand,
            base_seq,
            next_seq: base_seq.max(max_seen) + 1,
            sync,
        };
        Ok((wal, replay))
    }

    pub fn strand(&self) -> StrandId {
        self.strand
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Sequence of the last appended record (or the base).
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Append one record; it is durable when this returns.
    pub fn append(&mut self, op: WalOp, frame_id: FrameId, payload: Vec<u8>) -> Result<WalRecord> {
        let record = WalRecord {
            strand: self.strand,
            seq: self.next_seq,
            op,
            frame_id,
            payload,
        };
        self.file.write_all(&record.encode())?;
        if self.sync {
            self.file.sync_data()?;
        }
        self.next_seq += 1;
        Ok(record)
    }

    /// Drop every record at or below `seq`; the header records the new base.
    pub fn checkpoint(&mut self, seq: u64) -> Result<()> {
        if seq <= self.base_seq {
            return Ok(());
        }
        let bytes = fs::read(&self.path)?;
        let replay = read_records(&bytes, self.strand, seq);
        let keep: Vec<u8> = replay.records.iter().flat_map(|r| r.encode()).collect();
        let header = WalHeader {
            strand: self.strand,
            base_seq: seq,
        };
        write_file(&self.path, &header, &keep)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.base_seq = seq;
        self.next_seq = self.next_seq.max(seq + 1);
        debug!(strand = format_args!("{:016x}", self.strand), seq, kept = replay.records.len(), "WAL checkpointed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Highest sequence number among structurally intact records.
fn max_seq_in(bytes: &[u8]) -> u64 {
    read_records(bytes, 0, 0).records.iter().map(|r| r.seq).max().unwrap_or(0)
}

/// Temp file + fsync + rename.
fn write_file(path: &Path, header: &WalHeader, records: &[u8]) -> Result<()> {
    let tmp = path.with_extension("wal.tmp");
    {
        let mut file = File::create(&tmp)?;
        header.write_to(&mut file)?;
        file.write_all(records)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
