//! Leveled compaction.
//!
//! L0 tables may overlap (each is one memtable flush); deeper levels hold
//! non-overlapping key ranges and grow by a size multiplier. A compaction
//! merges the picked inputs newest-wins and writes one output table at the
//! target level. Tombstones are dropped only when the output lands on the
//! bottom level, where nothing older can resurrect the key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use kasane_core::error::{Error, Result};

use crate::manifest::SSTableManifestEntry;
use crate::sstable::{SSTableConfig, SSTableReader, SSTableWriter};
use crate::KIND_TOMBSTONE;

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub max_levels: u32,
    pub l0_compaction_threshold: usize,
    pub level_size_multiplier: u64,
    pub base_level_bytes: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_levels: 4,
            l0_compaction_threshold: 4,
            level_size_multiplier: 10,
            base_level_bytes: 32 * 1024 * 1024, // 32MB for L1
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionJob {
    pub inputs: Vec<SSTableManifestEntry>,
    pub target_level: u32,
}

#[derive(Debug)]
pub struct CompactionOutcome {
    pub input_ids: Vec<u64>,
    pub output: Option<SSTableManifestEntry>,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub struct Compactor {
    config: CompactionConfig,
    sstable_config: SSTableConfig,
    sstable_dir: PathBuf,
    next_id: Arc<AtomicU64>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        sstable_config: SSTableConfig,
        sstable_dir: PathBuf,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            config,
            sstable_config,
            sstable_dir,
            next_id,
        }
    }

    /// Decide whether anything needs compacting.
    pub fn pick_compaction(&self, sstables: &[SSTableManifestEntry]) -> Option<CompactionJob> {
        // L0 first: too many overlapping flush outputs hurt reads most.
        let l0: Vec<_> = sstables.iter().filter(|s| s.level == 0).cloned().collect();
        if l0.len() >= self.config.l0_compaction_threshold {
            let mut inputs = l0;
            // L0 keys overlap L1 arbitrarily; pull in every L1 table that
            // intersects the merged range.
            let min = inputs.iter().map(|s| s.min_key.clone()).min().unwrap_or_default();
            let max = inputs.iter().map(|s| s.max_key.clone()).max().unwrap_or_default();
            inputs.extend(
                sstables
                    .iter()
                    .filter(|s| s.level == 1 && s.min_key <= max && s.max_key >= min)
                    .cloned(),
            );
            return Some(CompactionJob {
                inputs,
                target_level: 1,
            });
        }

        // Deeper levels: compact when a level exceeds its size budget.
        for level in 1..self.config.max_levels.saturating_sub(1) {
            let level_tables: Vec<_> =
                sstables.iter().filter(|s| s.level == level).cloned().collect();
            let total: u64 = level_tables.iter().map(|s| s.size).sum();
            let budget = self.config.base_level_bytes
                * self.config.level_size_multiplier.pow(level.saturating_sub(1));
            if total <= budget || level_tables.is_empty() {
                continue;
            }

            let oldest = match level_tables.iter().min_by_key(|s| s.creation_time) {
                Some(t) => t.clone(),
                None => continue,
            };
            let mut inputs = vec![oldest.clone()];
            inputs.extend(
                sstables
                    .iter()
                    .filter(|s| {
                        s.level == level + 1
                            && s.min_key <= oldest.max_key
                            && s.max_key >= oldest.min_key
                    })
                    .cloned(),
            );
            return Some(CompactionJob {
                inputs,
                target_level: level + 1,
            });
        }

        None
    }

    /// Merge the job's inputs into one table at the target level.
    pub fn execute(&self, job: CompactionJob) -> Result<CompactionOutcome> {
        let input_ids: Vec<u64> = job.inputs.iter().map(|s| s.id).collect();
        let bytes_read: u64 = job.inputs.iter().map(|s| s.size).sum();

        // Newest-first insertion: lower level wins, then higher id (later
        // flush). `or_insert`-style semantics keep the first writer.
        let mut ordered = job.inputs.clone();
        ordered.sort_by(|a, b| a.level.cmp(&b.level).then(b.id.cmp(&a.id)));

        let mut merged: BTreeMap<Bytes, (Bytes, u64, u64)> = BTreeMap::new();
        for input in &ordered {
            let reader = SSTableReader::open(&input.path)?;
            for pair in reader.iter() {
                let (key, value) = pair?;
                merged
                    .entry(key)
                    .or_insert((value, input.min_ts, input.max_ts));
            }
        }

        let drop_tombstones = job.target_level >= self.config.max_levels - 1;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let level_dir = self.sstable_dir.join(format!("L{}", job.target_level));
        std::fs::create_dir_all(&level_dir)?;
        let output_path = level_dir.join(format!("{}_{}.sst", id, timestamp));

        let mut writer = SSTableWriter::new(&output_path, self.sstable_config.clone())?;
        let mut written = 0u64;
        let mut min_ts = u64::MAX;
        let mut max_ts = 0u64;

        for (key, (value, in_min_ts, in_max_ts)) in &merged {
            if drop_tombstones && value.first() == Some(&KIND_TOMBSTONE) {
                continue;
            }
            writer.add(key, value)?;
            written += 1;
            min_ts = min_ts.min(*in_min_ts);
            max_ts = max_ts.max(*in_max_ts);
        }

        let output = if written > 0 {
            let info = writer.finish()?;
            Some(SSTableManifestEntry {
                id,
                level: job.target_level,
                path: info.path,
                size: info.file_size,
                entry_count: info.entry_count,
                min_key: info.min_key,
                max_key: info.max_key,
                min_ts: if min_ts == u64::MAX { 0 } else { min_ts },
                max_ts,
                creation_time: info.creation_time,
            })
        } else {
            // Everything merged away (all tombstones at the bottom).
            drop(writer);
            let _ = std::fs::remove_file(&output_path);
            None
        };

        let bytes_written = output.as_ref().map(|o| o.size).unwrap_or(0);
        info!(
            "Compaction: {} inputs -> L{}, {} entries kept",
            input_ids.len(),
            job.target_level,
            written
        );

        Ok(CompactionOutcome {
            input_ids,
            output,
            bytes_read,
            bytes_written,
        })
    }

    /// Remove input files once the manifest no longer references them.
    pub fn cleanup_inputs(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(Error::Compaction {
                        reason: format!("failed to remove {:?}: {}", path, e),
                    });
                }
            }
            debug!("Removed compacted input: {:?}", path);
        }
        Ok(())
    }

    pub fn level_dir(&self, level: u32) -> PathBuf {
        self.sstable_dir.join(format!("L{}", level))
    }
}

pub(crate) fn ensure_level_dirs(sstable_dir: &Path, max_levels: u32) -> Result<()> {
    for level in 0..max_levels {
        std::fs::create_dir_all(sstable_dir.join(format!("L{}", level)))?;
    }
    Ok(())
}
