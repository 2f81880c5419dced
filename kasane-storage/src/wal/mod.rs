//! Write-Ahead Log with group commit and per-transaction record chaining.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Write Path (Group Commit)                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Writer 1 ──┐                                                   │
//! │  Writer 2 ──┼──► Channel ──► Background Task ──► Batch fsync    │
//! │  Writer 3 ──┘                                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! File Format
//! - Header: 64 bytes (magic, version, timestamps, record count)
//! - Records: fixed 64-byte header + variable payload
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WAL File Layout                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Header (64 bytes)                                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Magic Number (8 bytes): "KASANEWL"                  │    │
//! │  │ Version (4 bytes)                                   │    │
//! │  │ Creation Time (8 bytes)                             │    │
//! │  │ First Timestamp (8 bytes)                           │    │
//! │  │ Last Timestamp (8 bytes)                            │    │
//! │  │ Record Count (8 bytes)                              │    │
//! │  │ File Checksum (4 bytes)                             │    │
//! │  │ Reserved (16 bytes)                                 │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Record 1                                                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │ Record Header (64 bytes)                            │    │
//! │  │   - Transaction Id (8 bytes)                        │    │
//! │  │   - Timestamp ns (8 bytes)                          │    │
//! │  │   - Operation Type (8 bytes)                        │    │
//! │  │   - Key Hash (8 bytes)                              │    │
//! │  │   - Value Size (8 bytes)                            │    │
//! │  │   - Checksum (8 bytes)                              │    │
//! │  │   - Previous-Record Offset (8 bytes)  ──┐           │    │
//! │  │   - Flags (8 bytes)                     │           │    │
//! │  ├─────────────────────────────────────────┼───────────┤    │
//! │  │ Payload (variable)       backward chain │ per txn   │    │
//! │  └─────────────────────────────────────────┴───────────┘    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Record 2...N                                               │
//! └─────────────────────────────────────────────────────────────┘

mod file;
mod iterator;
mod types;

pub use iterator::WalRecordIterator;
pub use types::{WalConfig, WalOp, WalRecord};

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use kasane_core::crypto::path_hash;
use kasane_core::error::{Error, Result};
use kasane_core::metrics::Metrics;
use kasane_core::types::monotonic_ns;

use file::{
    create_file, finalize_header, read_header_last_ts, record_size, recover_file, write_record,
    WalFile,
};

/// One durable mutation to log.
#[derive(Debug, Clone)]
pub enum WalAppend {
    Set {
        txn_id: u64,
        path: String,
        record: Bytes,
    },
    Delete {
        txn_id: u64,
        path: String,
    },
    Commit {
        txn_id: u64,
    },
    Abort {
        txn_id: u64,
    },
    Checkpoint,
}

struct WriteRequest {
    records: Vec<WalRecord>,
    response: oneshot::Sender<Result<()>>,
}

/// Per-transaction backward chain within the current file.
type TxnChain = Arc<Mutex<HashMap<u64, u64>>>;

pub struct WriteAheadLog {
    wal_dir: PathBuf,
    config: WalConfig,
    current_file: Arc<RwLock<WalFile>>,
    chain: TxnChain,
    metrics: Metrics,
    write_tx: mpsc::Sender<WriteRequest>,
}

impl WriteAheadLog {
    /// Create or recover a WAL in the given directory.
    pub async fn new(
        wal_dir: impl AsRef<Path>,
        config: WalConfig,
        metrics: Metrics,
    ) -> Result<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&wal_dir).await.map_err(|e| Error::Io {
            message: format!("failed to create WAL directory {:?}", wal_dir),
            source: e,
        })?;

        let wal_file = Self::open_or_create(&wal_dir, &config).await?;
        let current_file = Arc::new(RwLock::new(wal_file));
        let chain: TxnChain = Arc::new(Mutex::new(HashMap::new()));
        let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(config.max_batch_size * 2);

        let bg_file = Arc::clone(&current_file);
        let bg_chain = Arc::clone(&chain);
        let bg_config = config.clone();
        let bg_metrics = metrics.clone();
        let bg_dir = wal_dir.clone();
        tokio::spawn(async move {
            Self::group_commit_loop(write_rx, bg_file, bg_chain, bg_config, bg_metrics, bg_dir)
                .await;
        });

        Ok(Self {
            wal_dir,
            config,
            current_file,
            chain,
            metrics,
            write_tx,
        })
    }

    /// Append one mutation (goes through group commit).
    pub async fn append(&self, op: WalAppend) -> Result<u64> {
        self.append_batch(vec![op]).await
    }

    /// Append several mutations as one durable unit: all of them hit disk
    /// under a single fsync before this returns. This is the transaction
    /// prepare/commit path.
    pub async fn append_batch(&self, ops: Vec<WalAppend>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(monotonic_ns());
        }

        let records: Vec<WalRecord> = ops.into_iter().map(Self::create_record).collect();
        let last_ts = records.last().map(|r| r.timestamp_ns).unwrap_or(0);
        let total_bytes: u64 = records.iter().map(|r| record_size(r) as u64).sum();

        let (tx, rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest {
                records,
                response: tx,
            })
            .await
            .map_err(|_| Error::WriteAheadLog {
                message: "WAL channel closed".to_string(),
                source: None,
            })?;

        rx.await.map_err(|_| Error::WriteAheadLog {
            message: "WAL response channel closed".to_string(),
            source: None,
        })??;

        self.metrics.record_wal_append(total_bytes);
        Ok(last_ts)
    }

    pub async fn flush(&self) -> Result<()> {
        let mut file = self.current_file.write();
        file.file.flush()?;
        file.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Read every record newer than `min_timestamp`, in timestamp order.
    pub async fn read_from(&self, min_timestamp: u64) -> Result<Vec<WalRecord>> {
        let mut records: Vec<WalRecord> = self.iter_from(min_timestamp).await?.collect::<Result<_>>()?;
        records.sort_by_key(|r| r.timestamp_ns);
        Ok(records)
    }

    pub async fn iter_from(&self, min_timestamp: u64) -> Result<WalRecordIterator> {
        self.flush().await?;

        let current_path = self.current_file.read().path.clone();
        let mut wal_files = self.list_wal_files().await?;
        wal_files.sort_by_key(|f| f.0);

        // Skip files fully behind the checkpoint.
        let paths: Vec<PathBuf> = wal_files
            .into_iter()
            .filter(|(_, path)| {
                if min_timestamp == 0 || *path == current_path {
                    return true;
                }
                read_header_last_ts(path)
                    .map(|last| last > min_timestamp)
                    .unwrap_or(true)
            })
            .map(|(_, p)| p)
            .collect();

        WalRecordIterator::new(paths, min_timestamp)
    }

    /// Delete WAL files whose records are all at or before `up_to_timestamp`.
    pub async fn truncate(&self, up_to_timestamp: u64) -> Result<()> {
        info!("Truncating WAL up to timestamp {}", up_to_timestamp);

        let current_path = self.current_file.read().path.clone();

        for (_, path) in self.list_wal_files().await? {
            // Never delete the current active file
            if path == current_path {
                continue;
            }
            let last = read_header_last_ts(&path).unwrap_or(u64::MAX);
            if last <= up_to_timestamp {
                info!("Deleting WAL file: {:?}", path);
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    fn create_record(op: WalAppend) -> WalRecord {
        let timestamp_ns = monotonic_ns();
        match op {
            WalAppend::Set {
                txn_id,
                path,
                record,
            } => WalRecord {
                txn_id,
                timestamp_ns,
                op: WalOp::Set,
                key_hash: path_hash(&path),
                checksum: 0,
                prev_offset: 0,
                flags: 0,
                path,
                record,
            },
            WalAppend::Delete { txn_id, path } => WalRecord {
                txn_id,
                timestamp_ns,
                op: WalOp::Delete,
                key_hash: path_hash(&path),
                checksum: 0,
                prev_offset: 0,
                flags: 0,
                path,
                record: Bytes::new(),
            },
            WalAppend::Commit { txn_id } => Self::marker(txn_id, timestamp_ns, WalOp::TxnCommit),
            WalAppend::Abort { txn_id } => Self::marker(txn_id, timestamp_ns, WalOp::TxnAbort),
            WalAppend::Checkpoint => Self::marker(0, timestamp_ns, WalOp::Checkpoint),
        }
    }

    fn marker(txn_id: u64, timestamp_ns: u64, op: WalOp) -> WalRecord {
        WalRecord {
            txn_id,
            timestamp_ns,
            op,
            key_hash: 0,
            checksum: 0,
            prev_offset: 0,
            flags: 0,
            path: String::new(),
            record: Bytes::new(),
        }
    }

    async fn group_commit_loop(
        mut rx: mpsc::Receiver<WriteRequest>,
        current_file: Arc<RwLock<WalFile>>,
        chain: TxnChain,
        config: WalConfig,
        metrics: Metrics,
        wal_dir: PathBuf,
    ) {
        let delay = std::time::Duration::from_micros(config.group_commit_delay_us);

        loop {
            let first = match rx.recv().await {
                Some(req) => req,
                None => break,
            };

            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + delay;

            while batch.len() < config.max_batch_size {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(req)) => batch.push(req),
                    _ => break,
                }
            }

            let result = write_batch_sync(&current_file, &chain, &batch, &config, &wal_dir);
            let ok = result.is_ok();

            for req in batch {
                let _ = req.response.send(if ok {
                    Ok(())
                } else {
                    Err(Error::WriteAheadLog {
                        message: "batch write failed".to_string(),
                        source: None,
                    })
                });
            }

            if !ok {
                metrics.record_storage_retry();
            }
        }
    }

    async fn open_or_create(wal_dir: &Path, config: &WalConfig) -> Result<WalFile> {
        let mut entries = tokio::fs::read_dir(wal_dir).await?;
        let mut wal_files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() == Some(std::ffi::OsStr::new("wal")) {
                wal_files.push(path);
            }
        }
        wal_files.sort();

        if let Some(latest) = wal_files.last() {
            recover_file(latest, config)
        } else {
            create_file(wal_dir, 0, config)
        }
    }

    async fn list_wal_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.wal_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() == Some(std::ffi::OsStr::new("wal")) {
                if let Some(name) = path.file_stem() {
                    if let Ok(ts) = name.to_string_lossy().parse::<u64>() {
                        files.push((ts, path));
                    }
                }
            }
        }
        Ok(files)
    }
}

fn write_batch_sync(
    current_file: &Arc<RwLock<WalFile>>,
    chain: &TxnChain,
    batch: &[WriteRequest],
    config: &WalConfig,
    wal_dir: &Path,
) -> Result<()> {
    for req in batch {
        for record in &req.records {
            let needs_rotation = {
                let f = current_file.read();
                f.size + record_size(record) as u64 > config.max_file_size
            };
            if needs_rotation {
                rotate_sync(current_file, chain, wal_dir, config)?;
            }

            let mut f = current_file.write();
            let offset = f.size;

            // Thread the per-transaction backward chain through the header.
            let mut record = record.clone();
            if record.txn_id != 0 {
                let mut chain = chain.lock();
                match record.op {
                    WalOp::TxnCommit | WalOp::TxnAbort => {
                        record.prev_offset = chain.remove(&record.txn_id).unwrap_or(0);
                    }
                    _ => {
                        record.prev_offset =
                            chain.insert(record.txn_id, offset).unwrap_or(0);
                    }
                }
            }

            let written = write_record(&mut f.file, &record)?;
            f.size += written as u64;
            f.record_count += 1;
            f.last_ts = record.timestamp_ns;
        }
    }

    if config.sync_on_write {
        let mut f = current_file.write();
        f.file.flush()?;
        f.file.get_ref().sync_all()?;
    }
    Ok(())
}

fn rotate_sync(
    current_file: &Arc<RwLock<WalFile>>,
    chain: &TxnChain,
    wal_dir: &Path,
    config: &WalConfig,
) -> Result<()> {
    let mut current = current_file.write();
    finalize_header(&mut current)?;

    let next_first_ts = current.last_ts + 1;
    *current = create_file(wal_dir, next_first_ts, config)?;

    // Offsets are file-relative; chains do not span rotations.
    chain.lock().clear();

    info!("Rotated WAL file, first timestamp: {}", next_first_ts);
    Ok(())
}
