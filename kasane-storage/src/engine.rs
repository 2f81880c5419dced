//! Storage Engine
//!
//! Orchestrates WAL, memtables, SSTables and compaction behind a small
//! async API. Crash recovery replays the WAL from the manifest checkpoint,
//! discarding records of transactions that never logged a commit marker.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use kasane_core::error::{Error, Result};
use kasane_core::metrics::Metrics;
use kasane_core::serialize::verify_record;

use crate::compaction::{ensure_level_dirs, CompactionConfig, Compactor};
use crate::manifest::{Manifest, SSTableManifestEntry};
use crate::memtable::{MemEntry, MemTableConfig, MemTableManager};
use crate::sstable::{SSTableConfig, SSTableReader, SSTableWriter};
use crate::wal::{WalAppend, WalConfig, WalOp, WriteAheadLog};
use crate::{frame_value, unframe_value};

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub wal: WalConfig,
    pub memtable: MemTableConfig,
    pub sstable: SSTableConfig,
    pub compaction: CompactionConfig,
    pub flush_interval: Duration,
    pub compaction_interval: Duration,
    /// Transient I/O failures are retried this many times with doubling
    /// delay before surfacing a storage error.
    pub io_retry_attempts: u32,
    pub io_retry_base_delay: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal: WalConfig::default(),
            memtable: MemTableConfig::default(),
            sstable: SSTableConfig::default(),
            compaction: CompactionConfig::default(),
            flush_interval: Duration::from_secs(30),
            compaction_interval: Duration::from_secs(60),
            io_retry_attempts: 3,
            io_retry_base_delay: Duration::from_millis(10),
        }
    }
}

/// Cached open readers, keyed by path. Compaction drops entries for files
/// it deletes.
struct ReaderPool {
    readers: Mutex<HashMap<PathBuf, Arc<SSTableReader>>>,
}

impl ReaderPool {
    fn new() -> Self {
        Self {
            readers: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, path: &PathBuf) -> Result<Arc<SSTableReader>> {
        if let Some(reader) = self.readers.lock().get(path) {
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(SSTableReader::open(path)?);
        self.readers
            .lock()
            .insert(path.clone(), Arc::clone(&reader));
        Ok(reader)
    }

    fn remove(&self, path: &PathBuf) {
        self.readers.lock().remove(path);
    }
}

pub struct StorageEngine {
    config: StorageConfig,
    wal: Arc<WriteAheadLog>,
    memtables: Arc<MemTableManager>,
    sstables: Arc<RwLock<Vec<SSTableManifestEntry>>>,
    manifest: Arc<Mutex<Manifest>>,
    readers: Arc<ReaderPool>,
    metrics: Metrics,
    shutdown: tokio::sync::watch::Sender<bool>,
    next_sstable_id: Arc<AtomicU64>,
    compactor: Arc<Compactor>,
}

impl StorageEngine {
    pub async fn new(config: StorageConfig, metrics: Metrics) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let wal_dir = config.data_dir.join("wal");
        let sstable_dir = config.data_dir.join("sstables");
        ensure_level_dirs(&sstable_dir, config.compaction.max_levels)?;

        let manifest = Manifest::load_or_create(&config.data_dir)?;
        let wal_checkpoint = manifest.wal_checkpoint;
        let next_sstable_id = Arc::new(AtomicU64::new(manifest.next_sstable_id()));

        info!(
            "Opening storage: checkpoint={}, sstables={}",
            wal_checkpoint,
            manifest.sstables.len()
        );

        let wal =
            Arc::new(WriteAheadLog::new(&wal_dir, config.wal.clone(), metrics.clone()).await?);
        let memtables = Arc::new(MemTableManager::new(config.memtable.clone(), metrics.clone()));

        let replayed = Self::replay_wal(&wal, &memtables, wal_checkpoint).await?;
        if replayed > 0 {
            info!(
                "Crash recovery: replayed {} WAL records past checkpoint {}",
                replayed, wal_checkpoint
            );
        }

        let sstables = manifest.sstables.clone();
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        let compactor = Arc::new(Compactor::new(
            config.compaction.clone(),
            config.sstable.clone(),
            sstable_dir,
            Arc::clone(&next_sstable_id),
        ));

        let engine = Self {
            config,
            wal,
            memtables,
            sstables: Arc::new(RwLock::new(sstables)),
            manifest: Arc::new(Mutex::new(manifest)),
            readers: Arc::new(ReaderPool::new()),
            metrics,
            shutdown: shutdown_tx,
            next_sstable_id,
            compactor,
        };

        engine.start_background_tasks();
        Ok(engine)
    }

    /// Replay WAL records newer than the checkpoint into the memtable.
    ///
    /// Two passes: the first resolves transaction fates, the second applies
    /// auto-committed records plus those of committed transactions.
    async fn replay_wal(
        wal: &WriteAheadLog,
        memtables: &MemTableManager,
        checkpoint: u64,
    ) -> Result<usize> {
        let records = wal.read_from(checkpoint).await?;

        let mut committed: HashSet<u64> = HashSet::new();
        for record in &records {
            if record.op == WalOp::TxnCommit {
                committed.insert(record.txn_id);
            }
        }

        let mut replayed = 0;
        for record in records {
            let apply = record.txn_id == 0 || committed.contains(&record.txn_id);
            match record.op {
                WalOp::Set if apply => {
                    memtables.apply(
                        Arc::from(record.path.as_str()),
                        MemEntry {
                            record: Some(record.record.clone()),
                            timestamp_ns: record.timestamp_ns,
                            txn_id: record.txn_id,
                        },
                    )?;
                    replayed += 1;
                }
                WalOp::Delete if apply => {
                    memtables.apply(
                        Arc::from(record.path.as_str()),
                        MemEntry {
                            record: None,
                            timestamp_ns: record.timestamp_ns,
                            txn_id: record.txn_id,
                        },
                    )?;
                    replayed += 1;
                }
                WalOp::Set | WalOp::Delete => {
                    warn!(
                        "Discarding record of uncommitted transaction {} for {}",
                        record.txn_id, record.path
                    );
                }
                _ => {}
            }
        }

        Ok(replayed)
    }

    async fn append_with_retry(&self, ops: Vec<WalAppend>) -> Result<u64> {
        let mut delay = self.config.io_retry_base_delay;
        let mut last: Option<Error> = None;

        for attempt in 0..self.config.io_retry_attempts.max(1) {
            match self.wal.append_batch(ops.clone()).await {
                Ok(ts) => return Ok(ts),
                Err(e) => match e {
                    Error::Io { .. } | Error::WriteAheadLog { .. } => {
                        if attempt + 1 < self.config.io_retry_attempts {
                            self.metrics.record_storage_retry();
                            warn!("WAL append failed (attempt {}): {}", attempt + 1, e);
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                        last = Some(e);
                    }
                    other => return Err(other),
                },
            }
        }

        Err(Error::Storage {
            message: "WAL append failed after retries".to_string(),
            source: last.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        })
    }

    /// Durably write one value (auto-committed when `txn_id` is 0).
    pub async fn put(&self, path: &str, record: Bytes, txn_id: u64) -> Result<()> {
        let ts = self
            .append_with_retry(vec![WalAppend::Set {
                txn_id,
                path: path.to_string(),
                record: record.clone(),
            }])
            .await?;

        self.memtables.apply(
            Arc::from(path),
            MemEntry {
                record: Some(record),
                timestamp_ns: ts,
                txn_id,
            },
        )?;
        Ok(())
    }

    /// Durably remove one key.
    pub async fn delete(&self, path: &str, txn_id: u64) -> Result<()> {
        let ts = self
            .append_with_retry(vec![WalAppend::Delete {
                txn_id,
                path: path.to_string(),
            }])
            .await?;

        self.memtables.apply(
            Arc::from(path),
            MemEntry {
                record: None,
                timestamp_ns: ts,
                txn_id,
            },
        )?;
        Ok(())
    }

    /// Persist and apply a transaction's write-set as one durable unit:
    /// every record plus the commit marker land under a single fsync, then
    /// the writes become visible.
    pub async fn commit_writes(
        &self,
        txn_id: u64,
        writes: Vec<(String, Option<Bytes>)>,
    ) -> Result<()> {
        let mut ops: Vec<WalAppend> = writes
            .iter()
            .map(|(path, record)| match record {
                Some(bytes) => WalAppend::Set {
                    txn_id,
                    path: path.clone(),
                    record: bytes.clone(),
                },
                None => WalAppend::Delete {
                    txn_id,
                    path: path.clone(),
                },
            })
            .collect();
        ops.push(WalAppend::Commit { txn_id });

        let ts = self.append_with_retry(ops).await?;

        for (path, record) in writes {
            self.memtables.apply(
                Arc::from(path.as_str()),
                MemEntry {
                    record,
                    timestamp_ns: ts,
                    txn_id,
                },
            )?;
        }
        Ok(())
    }

    /// Log that a transaction rolled back. Its records (if any reached the
    /// WAL) stay dead: recovery only applies committed transactions.
    pub async fn abort_txn(&self, txn_id: u64) -> Result<()> {
        self.append_with_retry(vec![WalAppend::Abort { txn_id }])
            .await?;
        Ok(())
    }

    /// Point lookup: memtable first, then tables newest-to-oldest with a
    /// bloom-filter skip per table.
    ///
    /// A corrupt copy in a newer table falls back to the next older one —
    /// the most recent valid backup — before any error surfaces.
    pub async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        if let Some(entry) = self.memtables.get(path) {
            return Ok(entry.record);
        }

        let mut tables = self.sstables.read().await.clone();
        // Newest first: lower level, then later flush.
        tables.sort_by(|a, b| a.level.cmp(&b.level).then(b.id.cmp(&a.id)));

        let key = path.as_bytes();
        let mut saw_corruption = false;

        for table in &tables {
            if !(table.min_key.as_slice() <= key && key <= table.max_key.as_slice()) {
                continue;
            }
            let reader = match self.readers.get(&table.path) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Failed to open SSTable {:?}: {}", table.path, e);
                    saw_corruption = true;
                    continue;
                }
            };
            let framed = match reader.get(key) {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Corrupt block in {:?}: {}; trying older copy", table.path, e);
                    saw_corruption = true;
                    continue;
                }
            };

            match unframe_value(&framed)? {
                None => return Ok(None), // tombstone
                Some(record) => {
                    if !verify_record(record) {
                        warn!(
                            "Checksum mismatch for {} in {:?}; trying older copy",
                            path, table.path
                        );
                        saw_corruption = true;
                        continue;
                    }
                    return Ok(Some(Bytes::copy_from_slice(record)));
                }
            }
        }

        if saw_corruption {
            return Err(Error::Corruption {
                key: path.to_string(),
                detail: "no valid copy found in any table".to_string(),
            });
        }
        Ok(None)
    }

    /// Merge every live version into one tree (tombstones dropped).
    /// Used for snapshot export and full-tree validation.
    pub async fn scan_all(&self) -> Result<Vec<(String, Bytes)>> {
        let mut merged: HashMap<String, Option<Bytes>> = HashMap::new();

        let mut tables = self.sstables.read().await.clone();
        // Oldest first so newer tables overwrite.
        tables.sort_by(|a, b| b.level.cmp(&a.level).then(a.id.cmp(&b.id)));

        for table in &tables {
            let reader = self.readers.get(&table.path)?;
            for pair in reader.iter() {
                let (key, framed) = pair?;
                let path = String::from_utf8_lossy(&key).to_string();
                let record = unframe_value(&framed)?.map(Bytes::copy_from_slice);
                merged.insert(path, record);
            }
        }

        for (path, entry) in self.memtables.merged_entries() {
            merged.insert(path.to_string(), entry.record);
        }

        let mut out: Vec<(String, Bytes)> = merged
            .into_iter()
            .filter_map(|(path, record)| record.map(|r| (path, r)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Live memtable contents (recently written keys), for cache warming.
    pub fn recent_entries(&self) -> Vec<(String, Bytes)> {
        self.memtables
            .merged_entries()
            .into_iter()
            .filter_map(|(path, entry)| entry.record.map(|r| (path.to_string(), r)))
            .collect()
    }

    /// Seal the active memtable and flush everything to L0 tables.
    pub async fn force_flush(&self) -> Result<()> {
        self.memtables.seal_active();
        Self::flush_memtables(
            &self.memtables,
            &self.sstables,
            &self.manifest,
            &self.wal,
            &self.config,
            &self.next_sstable_id,
            &self.metrics,
        )
        .await
    }

    pub async fn flush_wal(&self) -> Result<()> {
        self.wal.flush().await
    }

    pub fn wal_checkpoint(&self) -> u64 {
        self.manifest.lock().wal_checkpoint
    }

    pub async fn sstable_count(&self) -> usize {
        self.sstables.read().await.len()
    }

    /// Run one compaction round if the tree needs it.
    pub async fn compact_now(&self) -> Result<()> {
        Self::run_compaction(
            &self.compactor,
            &self.sstables,
            &self.manifest,
            &self.readers,
            &self.config,
            &self.metrics,
        )
        .await
    }

    fn start_background_tasks(&self) {
        // Flush task
        let memtables = Arc::clone(&self.memtables);
        let sstables = Arc::clone(&self.sstables);
        let manifest = Arc::clone(&self.manifest);
        let wal = Arc::clone(&self.wal);
        let config = self.config.clone();
        let next_id = Arc::clone(&self.next_sstable_id);
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut flush_interval = interval(config.flush_interval);
            flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = flush_interval.tick() => {
                        if let Err(e) = Self::flush_memtables(
                            &memtables, &sstables, &manifest, &wal, &config, &next_id, &metrics,
                        ).await {
                            error!("Flush error: {:?}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Shutting down flush task");
                        break;
                    }
                }
            }
        });

        // Compaction task
        let sstables = Arc::clone(&self.sstables);
        let manifest = Arc::clone(&self.manifest);
        let compactor = Arc::clone(&self.compactor);
        let readers = Arc::clone(&self.readers);
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut compaction_interval = interval(config.compaction_interval);
            compaction_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = compaction_interval.tick() => {
                        if let Err(e) = Self::run_compaction(
                            &compactor, &sstables, &manifest, &readers, &config, &metrics,
                        ).await {
                            error!("Compaction error: {:?}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Shutting down compaction task");
                        break;
                    }
                }
            }
        });
    }

    async fn flush_memtables(
        memtables: &Arc<MemTableManager>,
        sstables: &Arc<RwLock<Vec<SSTableManifestEntry>>>,
        manifest: &Arc<Mutex<Manifest>>,
        wal: &Arc<WriteAheadLog>,
        config: &StorageConfig,
        next_id: &Arc<AtomicU64>,
        metrics: &Metrics,
    ) -> Result<()> {
        while let Some(memtable) = memtables.take_for_flush() {
            let entries = memtable.entries();
            if entries.is_empty() {
                continue;
            }

            info!("Flushing memtable with {} entries", entries.len());

            let sstable_id = next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs();
            let sstable_path = config
                .data_dir
                .join("sstables")
                .join("L0")
                .join(format!("{}_{}.sst", sstable_id, timestamp));

            let result = (|| -> Result<SSTableManifestEntry> {
                let mut writer = SSTableWriter::new(&sstable_path, config.sstable.clone())?;
                let mut min_ts = u64::MAX;
                let mut max_ts = 0u64;

                for (path, entry) in &entries {
                    let framed = frame_value(entry.record.as_deref());
                    writer.add(path.as_bytes(), &framed)?;
                    min_ts = min_ts.min(entry.timestamp_ns);
                    max_ts = max_ts.max(entry.timestamp_ns);
                }

                let info = writer.finish()?;
                Ok(SSTableManifestEntry {
                    id: sstable_id,
                    level: 0,
                    path: info.path,
                    size: info.file_size,
                    entry_count: info.entry_count,
                    min_key: info.min_key,
                    max_key: info.max_key,
                    min_ts: if min_ts == u64::MAX { 0 } else { min_ts },
                    max_ts,
                    creation_time: info.creation_time,
                })
            })();

            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    // Put the table back; the next flush tick retries.
                    memtables.restore_for_flush(memtable);
                    return Err(e);
                }
            };

            let checkpoint = entry.max_ts;
            {
                let mut m = manifest.lock();
                m.add_sstable(entry.clone());
                m.update_checkpoint(checkpoint);
                m.save(&config.data_dir)?;
            }

            sstables.write().await.push(entry);
            metrics.record_flush();

            info!(
                "Flushed memtable to L0 table {}, checkpoint now {}",
                sstable_id, checkpoint
            );

            wal.truncate(checkpoint).await?;
        }

        Ok(())
    }

    async fn run_compaction(
        compactor: &Arc<Compactor>,
        sstables: &Arc<RwLock<Vec<SSTableManifestEntry>>>,
        manifest: &Arc<Mutex<Manifest>>,
        readers: &Arc<ReaderPool>,
        config: &StorageConfig,
        metrics: &Metrics,
    ) -> Result<()> {
        let manifest_entries = manifest.lock().sstables.clone();

        let job = match compactor.pick_compaction(&manifest_entries) {
            Some(job) => job,
            None => return Ok(()),
        };

        let input_paths: Vec<PathBuf> = job.inputs.iter().map(|s| s.path.clone()).collect();
        let outcome = compactor.execute(job)?;

        {
            let mut m = manifest.lock();
            m.remove_sstables(&outcome.input_ids);
            if let Some(ref output) = outcome.output {
                m.add_sstable(output.clone());
            }
            m.save(&config.data_dir)?;
        }

        {
            let mut tables = sstables.write().await;
            tables.retain(|t| !outcome.input_ids.contains(&t.id));
            if let Some(ref output) = outcome.output {
                tables.push(output.clone());
            }
        }

        for path in &input_paths {
            readers.remove(path);
        }
        compactor.cleanup_inputs(&input_paths)?;
        metrics.record_compaction();

        info!(
            "Compaction complete: {} files merged, {} bytes reclaimed",
            outcome.input_ids.len(),
            outcome.bytes_read.saturating_sub(outcome.bytes_written)
        );

        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
