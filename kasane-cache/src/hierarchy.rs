//! The hierarchy: probe order, promotion, demotion and invalidation.

use std::sync::Arc;

use kasane_core::metrics::Metrics;
use kasane_core::types::StoredValue;

use crate::entry::CacheEntry;
use crate::level::{Associative, DirectMapped, SetAssociative};
use crate::policy::AdaptivePolicy;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_slots: usize,
    pub l2_sets: usize,
    pub l2_ways: usize,
    pub l3_max_bytes: usize,
    /// Entries at least this large are stored compressed in L3.
    pub l3_compress_threshold: usize,
    /// Lookups per adaptive-policy sampling window.
    pub adaptive_window: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_slots: 1024,
            l2_sets: 256,
            l2_ways: 4,
            l3_max_bytes: 16 * 1024 * 1024, // 16MB
            l3_compress_threshold: 512,
            adaptive_window: 1024,
        }
    }
}

pub struct CacheHierarchy {
    l1: DirectMapped,
    l2: SetAssociative,
    l3: Associative,
    policy: AdaptivePolicy,
    metrics: Metrics,
}

impl CacheHierarchy {
    pub fn new(config: CacheConfig, metrics: Metrics) -> Self {
        Self {
            l1: DirectMapped::new(config.l1_slots),
            l2: SetAssociative::new(config.l2_sets, config.l2_ways),
            l3: Associative::new(config.l3_max_bytes, config.l3_compress_threshold),
            policy: AdaptivePolicy::new(config.adaptive_window),
            metrics,
        }
    }

    /// Probe L1 → L2 → L3. A hit below L1 promotes the entry upward;
    /// whatever the promotion displaces falls one level down.
    pub fn get(&self, hash: u64, path: &str) -> Option<Arc<StoredValue>> {
        if let Some(entry) = self.l1.probe(hash, path) {
            entry.touch();
            self.policy.record_lookup(true);
            self.metrics.record_cache_hit(1);
            return Some(Arc::clone(&entry.value));
        }

        if let Some(entry) = self.l2.probe(hash, path) {
            entry.touch();
            self.policy.record_lookup(true);
            self.metrics.record_cache_hit(2);
            let value = Arc::clone(&entry.value);
            self.l2.remove(hash, path);
            self.promote_to_l1(entry);
            return Some(value);
        }

        if let Some(entry) = self.l3.probe(hash, path) {
            entry.touch();
            self.policy.record_lookup(true);
            self.metrics.record_cache_hit(3);
            let value = Arc::clone(&entry.value);
            self.l3.remove(hash, path);
            self.promote_to_l2(entry);
            return Some(value);
        }

        self.policy.record_lookup(false);
        self.metrics.record_cache_miss();
        None
    }

    /// Install (or replace) the current value for a key. The handle swap
    /// is atomic per slot; an older version never overwrites a newer one.
    pub fn insert(&self, path: Arc<str>, hash: u64, value: Arc<StoredValue>) {
        let entry = Arc::new(CacheEntry::new(path, hash, value));
        self.promote_to_l1(entry);
    }

    fn promote_to_l1(&self, entry: Arc<CacheEntry>) {
        self.metrics.record_promotion();
        if let Some(displaced) = self.l1.insert(entry) {
            if let Some(victim) = self.l2.insert(displaced, &self.policy) {
                let evicted = self.l3.insert(victim, &self.policy);
                for _ in 0..evicted {
                    self.metrics.record_eviction();
                }
            }
        }
    }

    fn promote_to_l2(&self, entry: Arc<CacheEntry>) {
        self.metrics.record_promotion();
        if let Some(victim) = self.l2.insert(entry, &self.policy) {
            let evicted = self.l3.insert(victim, &self.policy);
            for _ in 0..evicted {
                self.metrics.record_eviction();
            }
        }
    }

    /// Drop a key from every level. Visible to all levels before this
    /// returns, so an acknowledged write can never be shadowed by a stale
    /// cached copy.
    pub fn invalidate(&self, hash: u64, path: &str) {
        self.l1.remove(hash, path);
        self.l2.remove(hash, path);
        self.l3.remove(hash, path);
        self.metrics.record_invalidation();
    }

    pub fn clear(&self) {
        self.l1.clear();
        self.l2.clear();
        self.l3.clear();
    }

    pub fn eviction_mode(&self) -> crate::policy::EvictionMode {
        self.policy.mode()
    }
}
