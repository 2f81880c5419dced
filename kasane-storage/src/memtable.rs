//! In-memory sorted table holding the most recent writes.
//!
//! Entries map a key path to the encoded stored-record bytes, or to a
//! tombstone for deletions. The active table rotates to an immutable list
//! once full; immutable tables are drained by the flush task.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use tracing::info;

use kasane_core::error::{Error, Result};
use kasane_core::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct MemTableConfig {
    pub max_size: usize,
    pub max_entries: usize,
    pub max_age: Duration,
}

impl Default for MemTableConfig {
    fn default() -> Self {
        Self {
            max_size: 8 * 1024 * 1024, // 8MB
            max_entries: 100_000,
            max_age: Duration::from_secs(300),
        }
    }
}

/// One versioned mutation. `record` is `None` for tombstones.
#[derive(Debug, Clone)]
pub struct MemEntry {
    pub record: Option<Bytes>,
    pub timestamp_ns: u64,
    pub txn_id: u64,
}

pub struct MemTable {
    data: SkipMap<Arc<str>, MemEntry>,
    size_bytes: AtomicUsize,
    entry_count: AtomicUsize,
    max_ts: AtomicU64,
    created_at: Instant,
    config: MemTableConfig,
    read_only: AtomicU64,
}

impl MemTable {
    pub fn new(config: MemTableConfig) -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            max_ts: AtomicU64::new(0),
            created_at: Instant::now(),
            config,
            read_only: AtomicU64::new(0),
        }
    }

    pub fn apply(&self, path: Arc<str>, entry: MemEntry) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) != 0 {
            return Err(Error::MemTable {
                message: "memtable is read-only (being flushed)".to_string(),
            });
        }

        if self.should_flush() {
            return Err(Error::MemTable {
                message: "memtable is full".to_string(),
            });
        }

        let entry_size =
            path.len() + entry.record.as_ref().map(|r| r.len()).unwrap_or(0) + 32;

        self.max_ts.fetch_max(entry.timestamp_ns, Ordering::Relaxed);
        self.data.insert(path, entry);
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Look up a path. `Some(entry)` may still be a tombstone.
    pub fn get(&self, path: &str) -> Option<MemEntry> {
        self.data.get(path).map(|e| e.value().clone())
    }

    pub fn should_flush(&self) -> bool {
        let size = self.size_bytes.load(Ordering::Relaxed);
        let count = self.entry_count.load(Ordering::Relaxed);
        let age = self.created_at.elapsed();

        size >= self.config.max_size
            || count >= self.config.max_entries
            || age >= self.config.max_age
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn set_read_only(&self) {
        self.read_only.store(1, Ordering::Release);
    }

    /// Largest record timestamp in this table; drives the WAL checkpoint.
    pub fn max_timestamp(&self) -> u64 {
        self.max_ts.load(Ordering::Relaxed)
    }

    /// All entries in key order, for flushing.
    pub fn entries(&self) -> Vec<(Arc<str>, MemEntry)> {
        self.data
            .iter()
            .map(|e| (Arc::clone(e.key()), e.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> MemTableStats {
        MemTableStats {
            entry_count: self.entry_count.load(Ordering::Relaxed),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemTableStats {
    pub entry_count: usize,
    pub size_bytes: usize,
}

pub struct MemTableManager {
    active: RwLock<Arc<MemTable>>,
    immutable: RwLock<Vec<Arc<MemTable>>>,
    config: MemTableConfig,
    metrics: Metrics,
}

impl MemTableManager {
    pub fn new(config: MemTableConfig, metrics: Metrics) -> Self {
        let active = Arc::new(MemTable::new(config.clone()));
        Self {
            active: RwLock::new(active),
            immutable: RwLock::new(Vec::new()),
            config,
            metrics,
        }
    }

    pub fn apply(&self, path: Arc<str>, entry: MemEntry) -> Result<()> {
        for _ in 0..5 {
            let active = self.active.read();
            match active.apply(Arc::clone(&path), entry.clone()) {
                Ok(()) => return Ok(()),
                Err(Error::MemTable { .. }) => {
                    drop(active);
                    self.rotate();
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::MemTable {
            message: "apply failed after repeated rotation".to_string(),
        })
    }

    /// Newest-first lookup across active and immutable tables.
    pub fn get(&self, path: &str) -> Option<MemEntry> {
        if let Some(entry) = self.active.read().get(path) {
            return Some(entry);
        }
        for table in self.immutable.read().iter().rev() {
            if let Some(entry) = table.get(path) {
                return Some(entry);
            }
        }
        None
    }

    fn rotate(&self) {
        let mut active_lock = self.active.write();
        if !active_lock.should_flush() {
            return;
        }

        info!("Rotating memtable");
        active_lock.set_read_only();
        let old_table = Arc::clone(&active_lock);
        self.immutable.write().push(old_table);

        *active_lock = Arc::new(MemTable::new(self.config.clone()));
        self.metrics.record_flush();
    }

    /// Force the active table into the flush queue even if not full.
    pub fn seal_active(&self) {
        let mut active_lock = self.active.write();
        if active_lock.is_empty() {
            return;
        }
        active_lock.set_read_only();
        let old_table = Arc::clone(&active_lock);
        self.immutable.write().push(old_table);
        *active_lock = Arc::new(MemTable::new(self.config.clone()));
    }

    /// Oldest immutable table awaiting flush, if any.
    pub fn take_for_flush(&self) -> Option<Arc<MemTable>> {
        let mut immutable = self.immutable.write();
        if immutable.is_empty() {
            None
        } else {
            Some(immutable.remove(0))
        }
    }

    /// Put a table back at the front of the flush queue (flush failed).
    pub fn restore_for_flush(&self, table: Arc<MemTable>) {
        self.immutable.write().insert(0, table);
    }

    /// Entries of every live table, newest version winning.
    pub fn merged_entries(&self) -> Vec<(Arc<str>, MemEntry)> {
        let mut merged: std::collections::BTreeMap<Arc<str>, MemEntry> =
            std::collections::BTreeMap::new();
        for table in self.immutable.read().iter() {
            for (path, entry) in table.entries() {
                merged.insert(path, entry);
            }
        }
        for (path, entry) in self.active.read().entries() {
            merged.insert(path, entry);
        }
        merged.into_iter().collect()
    }

    pub fn stats(&self) -> MemTableStats {
        self.active.read().stats()
    }
}
