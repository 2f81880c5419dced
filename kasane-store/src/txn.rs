//! Snapshot transactions with optimistic conflict detection.
//!
//! A transaction stages its writes privately; nothing touches the global
//! store until commit. At commit time the manager checks, under the commit
//! lock, whether any staged key was committed by another transaction after
//! this one's snapshot was taken — if so the commit fails with a conflict
//! and the caller decides whether to re-issue. Rollback just discards the
//! write-set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use kasane_core::error::{Error, Result};
use kasane_core::metrics::Metrics;
use kasane_core::types::{ConfigKey, ConfigValue, KeyFlags, StoredValue};

#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Concurrent open transactions beyond this fail with a resource
    /// limit error.
    pub max_active: usize,
    pub default_commit_timeout: std::time::Duration,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_active: 256,
            default_commit_timeout: std::time::Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Reads see the state as of `begin`; write-write conflicts abort the
    /// later committer.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

/// A private write-set over a snapshot of the store.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    snapshot_version: u64,
    isolation: IsolationLevel,
    state: TxnState,
    writes: HashMap<ConfigKey, Option<StoredValue>>,
}

impl Transaction {
    fn new(id: u64, snapshot_version: u64, isolation: IsolationLevel) -> Self {
        Self {
            id,
            snapshot_version,
            isolation,
            state: TxnState::Active,
            writes: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TxnState) {
        self.state = state;
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(Error::Internal {
                message: format!("transaction {} is {:?}, not active", self.id, self.state),
            });
        }
        Ok(())
    }

    /// Stage a write. Validation runs during commit's prepare phase.
    pub fn set_value(&mut self, path: &str, value: ConfigValue) -> Result<()> {
        self.ensure_active()?;
        let key = ConfigKey::new(path)?;
        self.writes.insert(key, Some(StoredValue::new(value, self.id)));
        Ok(())
    }

    /// Stage a write whose persisted payload will be AEAD-wrapped.
    pub fn set_sensitive(&mut self, path: &str, value: ConfigValue) -> Result<()> {
        self.ensure_active()?;
        let mut flags = KeyFlags::default();
        flags.set(KeyFlags::ENCRYPTED | KeyFlags::CACHED | KeyFlags::PERSISTENT);
        let key = ConfigKey::with_flags(path, flags)?;
        let mut stored = StoredValue::new(value, self.id);
        stored.encrypted = true;
        self.writes.insert(key, Some(stored));
        Ok(())
    }

    /// Stage a removal.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.ensure_active()?;
        let key = ConfigKey::new(path)?;
        self.writes.insert(key, None);
        Ok(())
    }

    /// Read-your-writes: the staged value for a path, if any.
    /// `Some(None)` means this transaction staged a delete.
    pub fn staged(&self, path: &str) -> Option<Option<&ConfigValue>> {
        self.writes
            .iter()
            .find(|(k, _)| k.path() == path)
            .map(|(_, v)| v.as_ref().map(|sv| &sv.value))
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn writes(&self) -> &HashMap<ConfigKey, Option<StoredValue>> {
        &self.writes
    }

    pub(crate) fn take_writes(&mut self) -> HashMap<ConfigKey, Option<StoredValue>> {
        std::mem::take(&mut self.writes)
    }
}

/// Allocates transaction ids and versions, tracks per-key commit versions
/// for conflict detection, and serializes the commit critical section.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    /// Global version: advances once per committed write batch.
    version: AtomicU64,
    /// Last committed version per key hash.
    commit_versions: DashMap<u64, u64>,
    commit_lock: Mutex<()>,
    active: AtomicUsize,
    config: TxnConfig,
    metrics: Metrics,
}

impl TransactionManager {
    pub fn new(config: TxnConfig, metrics: Metrics) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            version: AtomicU64::new(0),
            commit_versions: DashMap::new(),
            commit_lock: Mutex::new(()),
            active: AtomicUsize::new(0),
            config,
            metrics,
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<Transaction> {
        let active = self.active.fetch_add(1, Ordering::AcqRel);
        if active >= self.config.max_active {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::ResourceLimit {
                resource: format!("concurrent transactions ({})", self.config.max_active),
            });
        }

        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.version.load(Ordering::Acquire);
        self.metrics.record_txn_started();
        Ok(Transaction::new(id, snapshot, isolation))
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn default_commit_timeout(&self) -> std::time::Duration {
        self.config.default_commit_timeout
    }

    pub(crate) fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) async fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().await
    }

    /// Optimistic check: any staged key committed after our snapshot?
    pub(crate) fn check_conflicts(&self, txn: &Transaction) -> Result<()> {
        for key in txn.writes().keys() {
            if let Some(committed) = self.commit_versions.get(&key.hash64()) {
                if *committed > txn.snapshot_version() {
                    return Err(Error::Conflict {
                        key: key.path().to_string(),
                        txn_id: txn.id(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Advance the global version and stamp every written key with it.
    pub(crate) fn mark_committed(&self, key_hashes: &[u64]) -> u64 {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        for hash in key_hashes {
            self.commit_versions.insert(*hash, version);
        }
        version
    }
}
