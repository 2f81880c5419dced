//! The three cache levels.
//!
//! Every level keeps the same invariant: replacing a value swaps the whole
//! entry handle under a slot lock held only for the swap, and a same-key
//! replacement never installs an older version over a newer one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use kasane_core::serialize::{decode_value, encode_value};
use kasane_core::types::{monotonic_ns, StoredValue};

use crate::entry::CacheEntry;
use crate::policy::AdaptivePolicy;

/// L1: direct-mapped by `hash % slots`, one entry per slot.
pub struct DirectMapped {
    slots: Vec<RwLock<Option<Arc<CacheEntry>>>>,
}

impl DirectMapped {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| RwLock::new(None)).collect(),
        }
    }

    #[inline]
    fn slot(&self, hash: u64) -> &RwLock<Option<Arc<CacheEntry>>> {
        &self.slots[(hash % self.slots.len() as u64) as usize]
    }

    pub fn probe(&self, hash: u64, path: &str) -> Option<Arc<CacheEntry>> {
        let slot = self.slot(hash).read();
        slot.as_ref()
            .filter(|e| e.key_hash == hash && &*e.path == path)
            .cloned()
    }

    /// Install an entry. Returns a displaced entry of a *different* key,
    /// which falls through to the next level.
    pub fn insert(&self, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        let mut slot = self.slot(entry.key_hash).write();
        match slot.take() {
            Some(old) if old.path == entry.path => {
                // Same key: keep whichever version is newer.
                if old.newer_than(&entry) {
                    *slot = Some(old);
                } else {
                    *slot = Some(entry);
                }
                None
            }
            other => {
                *slot = Some(entry);
                other
            }
        }
    }

    pub fn remove(&self, hash: u64, path: &str) -> Option<Arc<CacheEntry>> {
        let mut slot = self.slot(hash).write();
        if slot
            .as_ref()
            .map(|e| e.key_hash == hash && &*e.path == path)
            .unwrap_or(false)
        {
            slot.take()
        } else {
            None
        }
    }

    pub fn clear(&self) {
        for slot in &self.slots {
            slot.write().take();
        }
    }
}

/// L2: set-associative. `hash % sets` selects a set; a linear probe walks
/// its ways.
pub struct SetAssociative {
    sets: Vec<RwLock<Vec<Arc<CacheEntry>>>>,
    ways: usize,
}

impl SetAssociative {
    pub fn new(sets: usize, ways: usize) -> Self {
        let sets = sets.max(1);
        Self {
            sets: (0..sets)
                .map(|_| RwLock::new(Vec::with_capacity(ways)))
                .collect(),
            ways: ways.max(1),
        }
    }

    #[inline]
    fn set(&self, hash: u64) -> &RwLock<Vec<Arc<CacheEntry>>> {
        &self.sets[(hash % self.sets.len() as u64) as usize]
    }

    pub fn probe(&self, hash: u64, path: &str) -> Option<Arc<CacheEntry>> {
        let set = self.set(hash).read();
        set.iter()
            .find(|e| e.key_hash == hash && &*e.path == path)
            .cloned()
    }

    /// Install an entry; when the set is full the policy chooses a victim,
    /// which falls through to L3.
    pub fn insert(
        &self,
        entry: Arc<CacheEntry>,
        policy: &AdaptivePolicy,
    ) -> Option<Arc<CacheEntry>> {
        let mut set = self.set(entry.key_hash).write();

        if let Some(pos) = set.iter().position(|e| e.path == entry.path) {
            if !set[pos].newer_than(&entry) {
                set[pos] = entry;
            }
            return None;
        }

        if set.len() < self.ways {
            set.push(entry);
            return None;
        }

        let victim_idx = policy.victim_index(&set)?;
        let victim = set.swap_remove(victim_idx);
        set.push(entry);
        Some(victim)
    }

    pub fn remove(&self, hash: u64, path: &str) -> Option<Arc<CacheEntry>> {
        let mut set = self.set(hash).write();
        let pos = set
            .iter()
            .position(|e| e.key_hash == hash && &*e.path == path)?;
        Some(set.swap_remove(pos))
    }

    pub fn clear(&self) {
        for set in &self.sets {
            set.write().clear();
        }
    }
}

/// An L3 resident: either a live handle or a compressed payload.
enum L3Slot {
    Live(Arc<CacheEntry>),
    Packed(PackedEntry),
}

/// Large payloads are stored as zstd-compressed value encodings together
/// with the metadata needed to rebuild the `StoredValue` on a hit.
struct PackedEntry {
    key_hash: u64,
    path: Arc<str>,
    timestamp_ns: u64,
    txn_id: u64,
    checksum: u64,
    encrypted: bool,
    data: Vec<u8>,
    last_access: std::sync::atomic::AtomicU64,
    access_count: u64,
    size: usize,
}

impl L3Slot {
    fn size(&self) -> usize {
        match self {
            L3Slot::Live(e) => e.size,
            L3Slot::Packed(p) => p.size,
        }
    }

    fn last_access(&self) -> u64 {
        match self {
            L3Slot::Live(e) => e.last_access(),
            L3Slot::Packed(p) => p.last_access.load(Ordering::Relaxed),
        }
    }

    fn access_count(&self) -> u64 {
        match self {
            L3Slot::Live(e) => e.access_count(),
            L3Slot::Packed(p) => p.access_count,
        }
    }

    fn timestamp_ns(&self) -> u64 {
        match self {
            L3Slot::Live(e) => e.value.timestamp_ns,
            L3Slot::Packed(p) => p.timestamp_ns,
        }
    }
}

/// L3: fully associative with chaining, size-bounded in bytes.
pub struct Associative {
    map: DashMap<Arc<str>, L3Slot>,
    max_bytes: usize,
    compress_threshold: usize,
    current_bytes: AtomicUsize,
}

impl Associative {
    pub fn new(max_bytes: usize, compress_threshold: usize) -> Self {
        Self {
            map: DashMap::new(),
            max_bytes: max_bytes.max(4096),
            compress_threshold: compress_threshold.max(64),
            current_bytes: AtomicUsize::new(0),
        }
    }

    pub fn probe(&self, hash: u64, path: &str) -> Option<Arc<CacheEntry>> {
        let slot = self.map.get(path)?;
        match slot.value() {
            L3Slot::Live(entry) if entry.key_hash == hash => Some(Arc::clone(entry)),
            L3Slot::Packed(packed) if packed.key_hash == hash => {
                packed
                    .last_access
                    .store(monotonic_ns(), Ordering::Relaxed);
                match Self::unpack(packed) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Dropping undecodable L3 entry for {}: {}", path, e);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    fn unpack(packed: &PackedEntry) -> kasane_core::Result<Arc<CacheEntry>> {
        let raw = zstd::decode_all(&packed.data[..]).map_err(|e| {
            kasane_core::Error::Internal {
                message: format!("L3 decompression failed: {}", e),
            }
        })?;
        let value = decode_value(&raw)?;
        Ok(Arc::new(CacheEntry::new(
            Arc::clone(&packed.path),
            packed.key_hash,
            Arc::new(StoredValue {
                value,
                timestamp_ns: packed.timestamp_ns,
                txn_id: packed.txn_id,
                checksum: packed.checksum,
                encrypted: packed.encrypted,
            }),
        )))
    }

    fn pack(entry: &CacheEntry) -> Option<L3Slot> {
        let raw = encode_value(&entry.value.value);
        if raw.len() < 64 {
            return None;
        }
        let data = zstd::encode_all(&raw[..], 3).ok()?;
        if data.len() >= raw.len() {
            return None; // incompressible
        }
        Some(L3Slot::Packed(PackedEntry {
            key_hash: entry.key_hash,
            path: Arc::clone(&entry.path),
            timestamp_ns: entry.value.timestamp_ns,
            txn_id: entry.value.txn_id,
            checksum: entry.value.checksum,
            encrypted: entry.value.encrypted,
            size: data.len() + entry.path.len() + 64,
            data,
            last_access: std::sync::atomic::AtomicU64::new(entry.last_access()),
            access_count: entry.access_count(),
        }))
    }

    /// Install an entry, compressing large payloads and evicting coldest
    /// residents when over budget.
    pub fn insert(&self, entry: Arc<CacheEntry>, policy: &AdaptivePolicy) -> usize {
        if let Some(existing) = self.map.get(&entry.path) {
            if existing.value().timestamp_ns() > entry.value.timestamp_ns {
                return 0;
            }
        }

        let slot = if entry.size >= self.compress_threshold {
            Self::pack(&entry).unwrap_or(L3Slot::Live(entry))
        } else {
            L3Slot::Live(entry)
        };

        let added = slot.size();
        let path = match &slot {
            L3Slot::Live(e) => Arc::clone(&e.path),
            L3Slot::Packed(p) => Arc::clone(&p.path),
        };
        if let Some(old) = self.map.insert(path, slot) {
            self.current_bytes.fetch_sub(old.size(), Ordering::Relaxed);
        }
        self.current_bytes.fetch_add(added, Ordering::Relaxed);

        self.evict_to_budget(policy)
    }

    /// Evict coldest/least-used entries until under the byte budget.
    /// Returns the number of evicted entries.
    fn evict_to_budget(&self, policy: &AdaptivePolicy) -> usize {
        let mut evicted = 0;
        while self.current_bytes.load(Ordering::Relaxed) > self.max_bytes {
            let victim = {
                let mut best: Option<(Arc<str>, u64, u64)> = None;
                for item in self.map.iter() {
                    let score = match policy.mode() {
                        crate::policy::EvictionMode::Recency => {
                            (item.value().last_access(), item.value().access_count())
                        }
                        crate::policy::EvictionMode::Frequency => {
                            (item.value().access_count(), item.value().last_access())
                        }
                    };
                    let replace = match &best {
                        Some((_, s0, s1)) => (score.0, score.1) < (*s0, *s1),
                        None => true,
                    };
                    if replace {
                        best = Some((Arc::clone(item.key()), score.0, score.1));
                    }
                }
                best
            };

            match victim {
                Some((path, _, _)) => {
                    if let Some((_, slot)) = self.map.remove(&path) {
                        self.current_bytes.fetch_sub(slot.size(), Ordering::Relaxed);
                        evicted += 1;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&self, hash: u64, path: &str) -> bool {
        let matches = self
            .map
            .get(path)
            .map(|slot| match slot.value() {
                L3Slot::Live(e) => e.key_hash == hash,
                L3Slot::Packed(p) => p.key_hash == hash,
            })
            .unwrap_or(false);
        if matches {
            if let Some((_, slot)) = self.map.remove(path) {
                self.current_bytes.fetch_sub(slot.size(), Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    pub fn clear(&self) {
        self.map.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
