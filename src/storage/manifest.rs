//! Durable storage manifest.
//!
//! `manifest.json` is the single source of truth for which runs are live,
//! how far each strand's WAL has been folded into runs, and the id and epoch
//! counters. It is replaced atomically: write temp, fsync, rename.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::run::RunMeta;
use crate::error::{Result, VoltError};
use crate::frame::{FrameId, StrandId};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Live runs, oldest first.
    pub runs: Vec<RunMeta>,
    pub next_run_id: u64,
    pub next_frame_id: FrameId,
    pub last_epoch: u64,
    /// strand → highest WAL sequence contained in runs
    pub checkpoints: BTreeMap<StrandId, u64>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            runs: Vec::new(),
            next_run_id: 1,
            next_frame_id: 1,
            last_epoch: 0,
            checkpoints: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Read from the data directory. Returns None if absent.
    pub fn read_from(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let manifest: Self = serde_json::from_str(&contents)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(VoltError::InvalidFormat(format!(
                "Unsupported manifest version: {}",
                manifest.version
            )));
        }
        Ok(Some(manifest))
    }

    /// Commit atomically.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let json = serde_json::to_string_pretty(self)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!(runs = self.runs.len(), epoch = self.last_epoch, "manifest committed");
        Ok(())
    }

    pub fn checkpoint(&self, strand: StrandId) -> Option<u64> {
        self.checkpoints.get(&strand).copied()
    }

    pub fn allocate_run_id(&mut self) -> u64 {
        let id = self.next_run_id;
        self.next_run_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_manifest_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::read_from(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::default();
        let id = m.allocate_run_id();
        m.runs.push(RunMeta {
            id,
            entry_count: 3,
            bytes: 4096,
            min_frame: 1,
            max_frame: 3,
            max_epoch: 9,
        });
        m.next_frame_id = 4;
        m.last_epoch = 9;
        m.checkpoints.insert(0xDEAD_BEEF_0000_0001, 12);
        m.write_to(dir.path()).unwrap();

        let read = Manifest::read_from(dir.path()).unwrap().unwrap();
        assert_eq!(read, m);
        assert_eq!(read.checkpoint(0xDEAD_BEEF_0000_0001), Some(12));
        assert_eq!(read.next_run_id, 2);
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let m = Manifest {
            version: 99,
            ..Default::default()
        };
        m.write_to(dir.path()).unwrap();
        assert!(Manifest::read_from(dir.path()).is_err());
    }
}
