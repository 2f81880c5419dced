//! Adaptive eviction policy.
//!
//! Victim selection runs in one of two modes: recency (approximate LRU)
//! or frequency (approximate LFU). The policy samples the hit rate over
//! fixed-size lookup windows and flips mode whenever the rate degrades
//! against the previous window, on the theory that the current mode is
//! evicting the wrong entries for the present access pattern.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::entry::CacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    Recency,
    Frequency,
}

pub struct AdaptivePolicy {
    mode: AtomicU8,
    window_size: u64,
    window_lookups: AtomicU64,
    window_hits: AtomicU64,
    /// Previous window's hit rate in thousandths.
    prev_rate_mills: AtomicU64,
}

/// Hit-rate drop (in thousandths) that triggers a mode flip.
const FLIP_THRESHOLD_MILLS: u64 = 50;

impl AdaptivePolicy {
    pub fn new(window_size: u64) -> Self {
        Self {
            mode: AtomicU8::new(0),
            window_size: window_size.max(16),
            window_lookups: AtomicU64::new(0),
            window_hits: AtomicU64::new(0),
            prev_rate_mills: AtomicU64::new(u64::MAX),
        }
    }

    pub fn mode(&self) -> EvictionMode {
        if self.mode.load(Ordering::Relaxed) == 0 {
            EvictionMode::Recency
        } else {
            EvictionMode::Frequency
        }
    }

    /// Feed one lookup outcome into the current window.
    pub fn record_lookup(&self, hit: bool) {
        if hit {
            self.window_hits.fetch_add(1, Ordering::Relaxed);
        }
        let lookups = self.window_lookups.fetch_add(1, Ordering::Relaxed) + 1;
        if lookups < self.window_size {
            return;
        }

        // Window complete: compare against the previous one.
        let hits = self.window_hits.swap(0, Ordering::Relaxed);
        self.window_lookups.store(0, Ordering::Relaxed);
        let rate_mills = hits * 1000 / lookups;

        let prev = self.prev_rate_mills.swap(rate_mills, Ordering::Relaxed);
        if prev != u64::MAX && rate_mills + FLIP_THRESHOLD_MILLS < prev {
            let old = self.mode.fetch_xor(1, Ordering::Relaxed);
            debug!(
                "Eviction mode flip: {:?} -> {:?} (hit rate {} -> {} per mille)",
                if old == 0 {
                    EvictionMode::Recency
                } else {
                    EvictionMode::Frequency
                },
                self.mode(),
                prev,
                rate_mills
            );
        }
    }

    /// Index of the entry to evict among `candidates`.
    pub fn victim_index(&self, candidates: &[Arc<CacheEntry>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let idx = match self.mode() {
            EvictionMode::Recency => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_access())
                .map(|(i, _)| i),
            EvictionMode::Frequency => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.access_count(), e.last_access()))
                .map(|(i, _)| i),
        };
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasane_core::types::{ConfigValue, StoredValue};

    fn entry(path: &str) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            Arc::from(path),
            kasane_core::crypto::path_hash(path),
            Arc::new(StoredValue::new(ConfigValue::Bool(true), 0)),
        ))
    }

    #[test]
    fn recency_picks_coldest() {
        let policy = AdaptivePolicy::new(16);
        let entries = vec![entry("a"), entry("b"), entry("c")];
        // Touch all but the first to make it the coldest.
        entries[1].touch();
        entries[2].touch();
        assert_eq!(policy.victim_index(&entries), Some(0));
    }

    #[test]
    fn frequency_picks_least_used() {
        let policy = AdaptivePolicy::new(16);
        // Force frequency mode: two windows with a collapsing hit rate.
        for _ in 0..16 {
            policy.record_lookup(true);
        }
        for _ in 0..16 {
            policy.record_lookup(false);
        }
        assert_eq!(policy.mode(), EvictionMode::Frequency);

        let entries = vec![entry("a"), entry("b")];
        for _ in 0..5 {
            entries[0].touch();
        }
        assert_eq!(policy.victim_index(&entries), Some(1));
    }

    #[test]
    fn stable_rate_keeps_mode() {
        let policy = AdaptivePolicy::new(16);
        for _ in 0..64 {
            policy.record_lookup(true);
        }
        assert_eq!(policy.mode(), EvictionMode::Recency);
    }
}
