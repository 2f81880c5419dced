//! # Metrics
//!
//! Lock-free counters for monitoring store behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Read/write path
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,

    // Cache
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    l3_hits: AtomicU64,
    cache_misses: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,

    // Storage
    wal_appends: AtomicU64,
    wal_bytes: AtomicU64,
    memtable_flushes: AtomicU64,
    compactions: AtomicU64,
    storage_retries: AtomicU64,

    // Transactions
    txn_started: AtomicU64,
    txn_committed: AtomicU64,
    txn_conflicts: AtomicU64,
    txn_aborted: AtomicU64,

    // Validation and watches
    validation_failures: AtomicU64,
    watch_events: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.inner.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, level: u8) {
        let counter = match level {
            1 => &self.inner.l1_hits,
            2 => &self.inner.l2_hits,
            _ => &self.inner.l3_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.inner.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.inner.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_append(&self, bytes: u64) {
        self.inner.wal_appends.fetch_add(1, Ordering::Relaxed);
        self.inner.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.inner.memtable_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self) {
        self.inner.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_retry(&self) {
        self.inner.storage_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_started(&self) {
        self.inner.txn_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_committed(&self) {
        self.inner.txn_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_conflict(&self) {
        self.inner.txn_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_aborted(&self) {
        self.inner.txn_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.inner.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watch_event(&self) {
        self.inner.watch_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Current hit rate across all cache levels, in [0, 1].
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.inner.l1_hits.load(Ordering::Relaxed)
            + self.inner.l2_hits.load(Ordering::Relaxed)
            + self.inner.l3_hits.load(Ordering::Relaxed);
        let total = hits + self.inner.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            reads: i.reads.load(Ordering::Relaxed),
            writes: i.writes.load(Ordering::Relaxed),
            deletes: i.deletes.load(Ordering::Relaxed),
            l1_hits: i.l1_hits.load(Ordering::Relaxed),
            l2_hits: i.l2_hits.load(Ordering::Relaxed),
            l3_hits: i.l3_hits.load(Ordering::Relaxed),
            cache_misses: i.cache_misses.load(Ordering::Relaxed),
            promotions: i.promotions.load(Ordering::Relaxed),
            evictions: i.evictions.load(Ordering::Relaxed),
            invalidations: i.invalidations.load(Ordering::Relaxed),
            wal_appends: i.wal_appends.load(Ordering::Relaxed),
            wal_bytes: i.wal_bytes.load(Ordering::Relaxed),
            memtable_flushes: i.memtable_flushes.load(Ordering::Relaxed),
            compactions: i.compactions.load(Ordering::Relaxed),
            storage_retries: i.storage_retries.load(Ordering::Relaxed),
            txn_started: i.txn_started.load(Ordering::Relaxed),
            txn_committed: i.txn_committed.load(Ordering::Relaxed),
            txn_conflicts: i.txn_conflicts.load(Ordering::Relaxed),
            txn_aborted: i.txn_aborted.load(Ordering::Relaxed),
            validation_failures: i.validation_failures.load(Ordering::Relaxed),
            watch_events: i.watch_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub l3_hits: u64,
    pub cache_misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub wal_appends: u64,
    pub wal_bytes: u64,
    pub memtable_flushes: u64,
    pub compactions: u64,
    pub storage_retries: u64,
    pub txn_started: u64,
    pub txn_committed: u64,
    pub txn_conflicts: u64,
    pub txn_aborted: u64,
    pub validation_failures: u64,
    pub watch_events: u64,
}
