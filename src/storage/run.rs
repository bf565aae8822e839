//! Immutable sorted runs.
//!
//! A run is the on-disk form of one flushed memtable (or one compaction
//! output). Entries are addressed through a sorted key table and read in
//! place from the memory map.
//!
//! ```text
//! [Header 32 bytes]
//! [key table: RunKey × N, sorted by (frame id, epoch)]
//! [entry blobs]
//! [bloom filter over frame ids]
//! [footer 32 bytes]
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bloom::BloomFilter;
use super::mvcc::{Version, VersionData};
use super::types::{
    RunFooter, RunHeader, RunKey, DELETED_LEVEL, RUN_FOOTER_SIZE, RUN_HEADER_SIZE, RUN_KEY_SIZE,
};
use crate::error::{Result, VoltError};
use crate::frame::{EntryView, FrameId};

/// Manifest descriptor of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: u64,
    pub entry_count: u64,
    pub bytes: u64,
    pub min_frame: FrameId,
    pub max_frame: FrameId,
    pub max_epoch: u64,
}

pub fn run_file_name(id: u64) -> String {
    format!("run_{id:08}.vxr")
}

// ── Writer ─────────────────────────────────────────────────────────

/// Write `records` (sorted by frame id, then epoch) as run `id`.
pub fn write_run(dir: &Path, id: u64, records: &[(FrameId, Version)]) -> Result<RunMeta> {
    debug_assert!(records
        .windows(2)
        .all(|w| (w[0].0, w[0].1.epoch) < (w[1].0, w[1].1.epoch)));
    let n = records.len();
    let index_offset = RUN_HEADER_SIZE as u64;
    let data_offset = index_offset + (n * RUN_KEY_SIZE) as u64;

    let mut bloom = BloomFilter::new(n);
    let mut keys = Vec::with_capacity(n);
    let mut offset = data_offset;
    for (frame_id, version) in records {
        bloom.insert(*frame_id);
        let len = version.byte_len() as u32;
        let level = match version.data {
            VersionData::Deleted => DELETED_LEVEL,
            VersionData::Entry(_) => version.level,
        };
        keys.push(RunKey {
            frame_id: *frame_id,
            created_at: version.created_at,
            level,
            epoch: version.epoch,
            offset,
            len,
        });
        offset += len as u64;
    }
    let bloom_offset = offset;
    let footer_offset = bloom_offset + bloom.serialized_size() as u64;

    let path = dir.join(run_file_name(id));
    let tmp = path.with_extension("vxr.tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        RunHeader {
            entry_count: n as u64,
            footer_offset,
            max_epoch: records.iter().map(|(_, v)| v.epoch).max().unwrap_or(0),
        }
        .write_to(&mut w)?;
        for key in &keys {
            key.write_to(&mut w)?;
        }
        for (_, version) in records {
            if let VersionData::Entry(bytes) = &version.data {
                w.write_all(bytes)?;
            }
        }
        bloom.write_to(&mut w)?;
        RunFooter {
            bloom_offset,
            index_offset,
            data_offset,
        }
        .write_to(&mut w)?;
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;

    let meta = RunMeta {
        id,
        entry_count: n as u64,
        bytes: footer_offset + RUN_FOOTER_SIZE as u64,
        min_frame: records.first().map(|r| r.0).unwrap_or(0),
        max_frame: records.last().map(|r| r.0).unwrap_or(0),
        max_epoch: records.iter().map(|(_, v)| v.epoch).max().unwrap_or(0),
    };
    debug!(run = id, entries = n, bytes = meta.bytes, "sorted run written");
    Ok(meta)
}

// ── Reader ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SortedRun {
    id: u64,
    path: PathBuf,
    file: File,
    mmap: Mmap,
    header: RunHeader,
    footer: RunFooter,
    bloom: BloomFilter,
}

impl SortedRun {
    pub fn open(dir: &Path, id: u64) -> Result<Self> {
        let path = dir.join(run_file_name(id));
        let file = File::open(&path)?;
        // SAFETY: runs are immutable once renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };
        let header = RunHeader::from_bytes(&mmap)?;
        if mmap.len() < RUN_HEADER_SIZE + RUN_FOOTER_SIZE {
            return Err(VoltError::InvalidFormat(format!("Run {id} truncated")));
        }
        let footer = RunFooter::from_bytes(&mmap[mmap.len() - RUN_FOOTER_SIZE..])?;
        let keys_end = footer.index_offset as usize + header.entry_count as usize * RUN_KEY_SIZE;
        if keys_end > footer.data_offset as usize
            || footer.bloom_offset > header.footer_offset
            || header.footer_offset as usize + RUN_FOOTER_SIZE != mmap.len()
        {
            return Err(VoltError::InvalidFormat(format!("Run {id} offsets inconsistent")));
        }
        let bloom = BloomFilter::from_bytes(
            &mmap[footer.bloom_offset as usize..header.footer_offset as usize],
        )?;
        Ok(Self {
            id,
            path,
            file,
            mmap,
            header,
            footer,
            bloom,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.header.entry_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.entry_count == 0
    }

    pub fn max_epoch(&self) -> u64 {
        self.header.max_epoch
    }

    pub fn key(&self, i: usize) -> RunKey {
        let at = self.footer.index_offset as usize + i * RUN_KEY_SIZE;
        RunKey::from_bytes(&self.mmap[at..at + RUN_KEY_SIZE])
    }

    pub fn keys(&self) -> impl Iterator<Item = RunKey> + '_ {
        (0..self.len()).map(move |i| self.key(i))
    }

    pub fn may_contain(&self, id: FrameId) -> bool {
        self.bloom.maybe_contains(id)
    }

    /// Newest key for `id` with `epoch <= snapshot`.
    pub fn find(&self, id: FrameId, snapshot: u64) -> Option<RunKey> {
        if !self.may_contain(id) {
            return None;
        }
        // first row past (id, snapshot)
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = self.key(mid);
            if (k.frame_id, k.epoch) <= (id, snapshot) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let k = self.key(lo.checked_sub(1)?);
        (k.frame_id == id).then_some(k)
    }

    pub fn blob(&self, key: &RunKey) -> &[u8] {
        let start = key.offset as usize;
        &self.mmap[start..start + key.len as usize]
    }

    pub fn view(&self, key: &RunKey) -> Result<EntryView<'_>> {
        EntryView::new(self.blob(key))
    }

    /// Copy every version out (compaction input).
    pub fn versions(&self) -> Vec<(FrameId, Version)> {
        self.keys()
            .map(|k| {
                let data = if k.is_delete() {
                    VersionData::Deleted
                } else {
                    VersionData::Entry(Arc::from(self.blob(&k)))
                };
                (
                    k.frame_id,
                    Version {
                        epoch: k.epoch,
                        created_at: k.created_at,
                        level: k.level,
                        data,
                    },
                )
            })
            .collect()
    }

    pub fn file_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Hint the kernel to read this key's blob ahead of use.
    pub fn prefetch(&self, key: &RunKey) {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: advisory call on a valid open descriptor.
            unsafe {
                libc::posix_fadvise(
                    self.file.as_raw_fd(),
                    key.offset as libc::off_t,
                    key.len as libc::off_t,
                    libc::POSIX_FADV_WILLNEED,
                );
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_entry, Entry, Frame};
    use tempfile::TempDir;

    fn version(id: FrameId, epoch: u64) -> (FrameId, Version) {
        let mut frame = Frame::new("runs");
        frame.id = id;
        frame.created_at = id * 100;
        let mut v = [0.0f32; crate::frame::SLOT_DIM];
        v[(id % 256) as usize] = 1.0;
        frame.fill_slot(0, 0.5, &[(0, v)]).unwrap();
        let bytes = encode_entry(&Entry::Full(frame));
        (
            id,
            Version {
                epoch,
                created_at: id * 100,
                level: 3,
                data: VersionData::Entry(Arc::from(bytes.into_boxed_slice())),
            },
        )
    }

    #[test]
    fn test_write_open_find() {
        let dir = TempDir::new().unwrap();
        let records = vec![version(1, 1), version(1, 5), version(2, 2), version(9, 3)];
        let meta = write_run(dir.path(), 4, &records).unwrap();
        assert_eq!(meta.entry_count, 4);
        assert_eq!(meta.min_frame, 1);
        assert_eq!(meta.max_frame, 9);
        assert_eq!(meta.max_epoch, 5);

        let run = SortedRun::open(dir.path(), 4).unwrap();
        assert_eq!(run.len(), 4);
        assert_eq!(run.file_bytes(), meta.bytes);
        assert_eq!(run.find(1, 10).unwrap().epoch, 5);
        assert_eq!(run.find(1, 4).unwrap().epoch, 1);
        assert!(run.find(1, 0).is_none());
        assert!(run.find(3, 10).is_none());
        let k = run.find(9, 10).unwrap();
        let view = run.view(&k).unwrap();
        assert_eq!(view.id(), 9);
        assert_eq!(view.created_at(), 900);
        run.prefetch(&k);
    }

    #[test]
    fn test_delete_markers_survive() {
        let dir = TempDir::new().unwrap();
        let deleted = (
            2,
            Version {
                epoch: 7,
                created_at: 0,
                level: 3,
                data: VersionData::Deleted,
            },
        );
        let records = vec![version(2, 1), deleted];
        write_run(dir.path(), 1, &records).unwrap();
        let run = SortedRun::open(dir.path(), 1).unwrap();
        let k = run.find(2, 10).unwrap();
        assert!(k.is_delete());
        assert_eq!(k.len, 0);
        let versions = run.versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].1.data, VersionData::Deleted);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(run_file_name(3)), vec![0u8; 100]).unwrap();
        assert!(SortedRun::open(dir.path(), 3).is_err());
    }
}
