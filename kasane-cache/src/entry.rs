//! Cache entry bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kasane_core::types::{monotonic_ns, StoredValue};

/// One cached value with its access statistics.
///
/// The value handle is immutable; a write replaces the whole entry, so a
/// concurrent reader holds either the old or the new `Arc`, never a torn
/// record.
pub struct CacheEntry {
    pub key_hash: u64,
    pub path: Arc<str>,
    pub value: Arc<StoredValue>,
    pub size: usize,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    pub fn new(path: Arc<str>, key_hash: u64, value: Arc<StoredValue>) -> Self {
        let size = value.size_estimate() + path.len();
        Self {
            key_hash,
            path,
            value,
            size,
            last_access: AtomicU64::new(monotonic_ns()),
            access_count: AtomicU64::new(1),
        }
    }

    /// Record a hit.
    #[inline]
    pub fn touch(&self) {
        self.last_access.store(monotonic_ns(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Version ordering between two cached copies of the same key.
    pub fn newer_than(&self, other: &CacheEntry) -> bool {
        self.value.timestamp_ns > other.value.timestamp_ns
    }
}
