//! Tracks live SSTables and the WAL checkpoint.
//!
//! The manifest is the recovery root: on open it tells the engine which
//! tables exist and from which WAL timestamp replay must start. Saves are
//! atomic (write to a temp file, fsync, rename).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use kasane_core::error::{Error, Result};

const MANIFEST_FILE: &str = "MANIFEST.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SSTableManifestEntry {
    pub id: u64,
    pub level: u32,
    pub path: PathBuf,
    pub size: u64,
    pub entry_count: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub min_ts: u64,
    pub max_ts: u64,
    pub creation_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    /// Records at or before this WAL timestamp are in SSTables.
    pub wal_checkpoint: u64,
    /// BLAKE3 chain over successive checkpoints.
    pub checkpoint_hash: Option<String>,
    pub sstables: Vec<SSTableManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: 0,
            wal_checkpoint: 0,
            checkpoint_hash: None,
            sstables: Vec::new(),
        }
    }

    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::new());
        }

        let data = std::fs::read(&path)?;
        let manifest: Manifest =
            serde_json::from_slice(&data).map_err(|e| Error::Storage {
                message: format!("manifest parse error: {}", e),
                source: Some(Box::new(e)),
            })?;
        info!(
            "Loaded manifest: version={}, checkpoint={}, sstables={}",
            manifest.version,
            manifest.wal_checkpoint,
            manifest.sstables.len()
        );
        Ok(manifest)
    }

    pub fn save(&mut self, data_dir: &Path) -> Result<()> {
        self.version += 1;

        let data = serde_json::to_vec_pretty(self).map_err(|e| Error::Storage {
            message: format!("manifest encode error: {}", e),
            source: Some(Box::new(e)),
        })?;

        let path = data_dir.join(MANIFEST_FILE);
        let tmp = data_dir.join(format!("{}.tmp", MANIFEST_FILE));
        std::fs::write(&tmp, &data)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn add_sstable(&mut self, entry: SSTableManifestEntry) {
        self.sstables.push(entry);
    }

    pub fn remove_sstables(&mut self, ids: &[u64]) {
        self.sstables.retain(|s| !ids.contains(&s.id));
    }

    /// Advance the checkpoint, chaining its hash to the previous one.
    pub fn update_checkpoint(&mut self, timestamp: u64) {
        if timestamp <= self.wal_checkpoint {
            return;
        }
        let mut material = Vec::with_capacity(40);
        if let Some(prev) = &self.checkpoint_hash {
            material.extend_from_slice(prev.as_bytes());
        }
        material.extend_from_slice(&timestamp.to_le_bytes());

        self.wal_checkpoint = timestamp;
        self.checkpoint_hash = Some(kasane_core::crypto::blake3_hex(&material));
    }

    pub fn next_sstable_id(&self) -> u64 {
        self.sstables.iter().map(|s| s.id).max().unwrap_or(0) + 1
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new();
        manifest.add_sstable(SSTableManifestEntry {
            id: 1,
            level: 0,
            path: dir.path().join("1.sst"),
            size: 100,
            entry_count: 5,
            min_key: b"a".to_vec(),
            max_key: b"z".to_vec(),
            min_ts: 1,
            max_ts: 10,
            creation_time: 0,
        });
        manifest.update_checkpoint(10);
        manifest.save(dir.path()).unwrap();

        let reloaded = Manifest::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.wal_checkpoint, 10);
        assert_eq!(reloaded.sstables.len(), 1);
        assert!(reloaded.checkpoint_hash.is_some());
    }

    #[test]
    fn checkpoint_never_regresses() {
        let mut manifest = Manifest::new();
        manifest.update_checkpoint(10);
        let hash = manifest.checkpoint_hash.clone();
        manifest.update_checkpoint(5);
        assert_eq!(manifest.wal_checkpoint, 10);
        assert_eq!(manifest.checkpoint_hash, hash);
    }
}
