//! The configuration manager.
//!
//! Owns every subsystem and the current global version. Reads probe
//! L1 → L2 → L3 → storage, promoting on the way back up; validated writes
//! go to the WAL and memtable first, then replace the cached handle, then
//! notify watchers asynchronously.
//!
//! ## Initialization
//!
//! ```text
//! Uninitialized → AcquiringResources → InitializingCrypto
//!       → CompilingSchema → InitializingStorage → WarmingCache
//!       → Ready | Failed
//! ```
//!
//! Each phase must fully succeed before the next starts; a failure rolls
//! back everything acquired so far (subsystems drop in reverse order) and
//! surfaces the originating error.
//!
//! ## Degraded mode
//!
//! When storage keeps failing past its retry budget the store flips to
//! cache-only operation: reads serve from cache (with defaults for
//! misses), persistent writes are rejected, and the first successful
//! storage round-trip flips it back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use kasane_cache::CacheHierarchy;
use kasane_core::crypto::{provider_for, Encryptor};
use kasane_core::error::{Error, Result};
use kasane_core::metrics::{Metrics, MetricsSnapshot};
use kasane_core::schema::{Schema, ValidationLevel, ValidationReport};
use kasane_core::serialize::{
    decode_stored, encode_stored, read_envelope, verify_record, write_envelope, COMPRESSION_ZSTD,
};
use kasane_core::types::{monotonic_ns, ConfigKey, ConfigValue, KeyFlags, StoredValue};
use kasane_storage::StorageEngine;

use crate::config::StoreOptions;
use crate::txn::{IsolationLevel, Transaction, TransactionManager, TxnState};
use crate::watch::{ChangeEvent, WatchHandle, WatchOptions, WatchRegistry};

/// Initialization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    Uninitialized,
    AcquiringResources,
    InitializingCrypto,
    CompilingSchema,
    InitializingStorage,
    WarmingCache,
    Ready,
    Failed,
}

/// Per-write options.
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Write through to durable storage (`false` = cache-only).
    pub persist: bool,
    /// AEAD-wrap the persisted payload.
    pub encrypt: bool,
    /// Emit a change event to matching watchers.
    pub notify: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            persist: true,
            encrypt: false,
            notify: true,
        }
    }
}

pub struct ConfigStore {
    schema: Arc<Schema>,
    encryptor: Arc<Encryptor>,
    cache: Arc<CacheHierarchy>,
    storage: Arc<StorageEngine>,
    txns: Arc<TransactionManager>,
    watches: Arc<WatchRegistry>,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    degraded: AtomicBool,
    phase: RwLock<InitPhase>,
    metrics: Metrics,
}

impl ConfigStore {
    /// Walk the initialization phases. Any failure logs the phase, drops
    /// everything acquired so far and returns the originating error.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        let metrics = Metrics::new();
        let mut phase = InitPhase::Uninitialized;

        match Self::open_phases(options, metrics, &mut phase).await {
            Ok(store) => {
                *store.phase.write() = InitPhase::Ready;
                info!("Configuration store ready");
                Ok(store)
            }
            Err(e) => {
                error!(phase = ?phase, error = %e, "initialization failed; rolled back");
                Err(e)
            }
        }
    }

    async fn open_phases(
        options: StoreOptions,
        metrics: Metrics,
        phase: &mut InitPhase,
    ) -> Result<Self> {
        *phase = InitPhase::AcquiringResources;
        tokio::fs::create_dir_all(&options.data_dir).await?;

        *phase = InitPhase::InitializingCrypto;
        let provider = provider_for(&options.key_source)?;
        let encryptor = Arc::new(Encryptor::new(provider.as_ref())?);
        info!("Crypto initialized ({})", encryptor.provider());

        *phase = InitPhase::CompilingSchema;
        let schema = Arc::new(match &options.schema_path {
            Some(path) => Schema::load(path)?,
            None => Schema::permissive(),
        });
        info!("Schema compiled (version {})", schema.version());

        *phase = InitPhase::InitializingStorage;
        let storage = Arc::new(StorageEngine::new(options.storage.clone(), metrics.clone()).await?);

        *phase = InitPhase::WarmingCache;
        let cache = Arc::new(CacheHierarchy::new(options.cache.clone(), metrics.clone()));
        let mut warmed = 0usize;
        for (path, record) in storage.recent_entries() {
            match decode_stored(&record, &path, Some(&encryptor)) {
                Ok(stored) => {
                    let key = ConfigKey::new(&path)?;
                    cache.insert(key.path_arc(), key.hash64(), Arc::new(stored));
                    warmed += 1;
                }
                Err(e) => warn!("Skipping unreadable entry {} during warm-up: {}", path, e),
            }
        }
        info!("Cache warmed with {} entries", warmed);

        let txns = Arc::new(TransactionManager::new(options.txn.clone(), metrics.clone()));
        let (watches, events_tx) = WatchRegistry::spawn(options.watch.clone(), metrics.clone());

        Ok(Self {
            schema,
            encryptor,
            cache,
            storage,
            txns,
            watches,
            events_tx,
            degraded: AtomicBool::new(false),
            phase: RwLock::new(InitPhase::WarmingCache),
            metrics,
        })
    }

    pub fn phase(&self) -> InitPhase {
        *self.phase.read()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn current_version(&self) -> u64 {
        self.txns.current_version()
    }

    fn enter_degraded(&self, cause: &Error) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!("Storage unavailable ({}); degrading to cache-only operation", cause);
        }
    }

    fn exit_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Storage recovered; leaving cache-only operation");
        }
    }

    fn is_storage_failure(e: &Error) -> bool {
        matches!(e, Error::Storage { .. } | Error::Io { .. } | Error::WriteAheadLog { .. })
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Look up a value: L1 → L2 → L3 → storage, promoting the found value
    /// into the faster levels. Falls back to `default` when absent.
    pub async fn get_value(
        &self,
        path: &str,
        default: Option<ConfigValue>,
    ) -> Result<ConfigValue> {
        let key = ConfigKey::new(path)?;
        self.metrics.record_read();

        if let Some(stored) = self.cache.get(key.hash64(), path) {
            return Ok(stored.value.clone());
        }

        match self.storage.get(path).await {
            Ok(Some(record)) => {
                self.exit_degraded();
                let stored = Arc::new(decode_stored(&record, path, Some(&self.encryptor))?);
                self.cache
                    .insert(key.path_arc(), key.hash64(), Arc::clone(&stored));
                Ok(stored.value.clone())
            }
            Ok(None) => {
                self.exit_degraded();
                default.ok_or(Error::NotFound {
                    key: path.to_string(),
                })
            }
            Err(e) if Self::is_storage_failure(&e) => {
                self.enter_degraded(&e);
                default.ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Validated, durable write. Replaces the cached value atomically and
    /// notifies watchers off-thread.
    pub async fn set_value(
        &self,
        path: &str,
        value: ConfigValue,
        options: SetOptions,
    ) -> Result<()> {
        let mut key = ConfigKey::new(path)?;
        if options.encrypt {
            key.set_flag(KeyFlags::ENCRYPTED);
        }

        if let Err(e) = self.schema.validate_value(&key, &value) {
            self.metrics.record_validation_failure();
            return Err(e);
        }

        let mut stored = StoredValue::new(value.clone(), 0);
        stored.encrypted = options.encrypt;

        if options.persist {
            if self.is_degraded() {
                return Err(Error::Storage {
                    message: format!("storage degraded; persistent write of {} rejected", path),
                    source: None,
                });
            }
            let record = encode_stored(&stored, path, Some(&self.encryptor))?;
            match self.storage.put(path, Bytes::from(record), 0).await {
                Ok(()) => {}
                Err(e) => {
                    if Self::is_storage_failure(&e) {
                        self.enter_degraded(&e);
                    }
                    return Err(e);
                }
            }
        }

        let version = self.txns.mark_committed(&[key.hash64()]);
        let timestamp_ns = stored.timestamp_ns;
        self.cache
            .insert(key.path_arc(), key.hash64(), Arc::new(stored));
        self.metrics.record_write();

        if options.notify {
            let _ = self.events_tx.send(ChangeEvent {
                path: key.path_arc(),
                value: Some(value),
                version,
                timestamp_ns,
            });
        }
        Ok(())
    }

    /// Remove a key. The invalidation reaches every cache level before
    /// this returns.
    pub async fn delete_value(&self, path: &str, options: SetOptions) -> Result<()> {
        let key = ConfigKey::new(path)?;

        if options.persist {
            if self.is_degraded() {
                return Err(Error::Storage {
                    message: format!("storage degraded; delete of {} rejected", path),
                    source: None,
                });
            }
            match self.storage.delete(path, 0).await {
                Ok(()) => {}
                Err(e) => {
                    if Self::is_storage_failure(&e) {
                        self.enter_degraded(&e);
                    }
                    return Err(e);
                }
            }
        }

        let version = self.txns.mark_committed(&[key.hash64()]);
        self.cache.invalidate(key.hash64(), path);
        self.metrics.record_delete();

        if options.notify {
            let _ = self.events_tx.send(ChangeEvent {
                path: key.path_arc(),
                value: None,
                version,
                timestamp_ns: monotonic_ns(),
            });
        }
        Ok(())
    }

    /// Drop a key from every cache level; the next read goes to storage.
    pub fn invalidate(&self, path: &str) -> Result<()> {
        let key = ConfigKey::new(path)?;
        self.cache.invalidate(key.hash64(), path);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------

    /// Validate a whole configuration tree, independent of caching.
    pub async fn validate_configuration(
        &self,
        tree: &BTreeMap<String, ConfigValue>,
        level: ValidationLevel,
        timeout: Option<Duration>,
    ) -> Result<ValidationReport> {
        let schema = Arc::clone(&self.schema);
        let tree = tree.clone();
        let task = tokio::task::spawn_blocking(move || schema.validate_tree(&tree, level));

        let report = match timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| Error::Timeout {
                    operation: "validate_configuration".to_string(),
                })?,
            None => task.await,
        }
        .map_err(|e| Error::Internal {
            message: format!("validation task failed: {}", e),
        })?;

        if !report.is_valid() {
            self.metrics.record_validation_failure();
        }
        Ok(report)
    }

    /// Validate everything currently persisted.
    pub async fn validate_stored(&self, level: ValidationLevel) -> Result<ValidationReport> {
        let mut tree = BTreeMap::new();
        for (path, record) in self.storage.scan_all().await? {
            match decode_stored(&record, &path, Some(&self.encryptor)) {
                Ok(stored) => {
                    tree.insert(path, stored.value);
                }
                Err(e) => warn!("Skipping unreadable entry {} during validation: {}", path, e),
            }
        }
        self.validate_configuration(&tree, level, None).await
    }

    // -----------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------

    /// Subscribe to committed changes matching a glob pattern. Events are
    /// delivered from a dispatch task, never on the writer's thread.
    pub fn watch_changes(&self, pattern: &str, options: WatchOptions) -> Result<WatchHandle> {
        self.watches.register(pattern, options)
    }

    /// Callback flavor of [`ConfigStore::watch_changes`].
    pub fn watch_changes_fn(
        &self,
        pattern: &str,
        callback: impl Fn(ChangeEvent) + Send + Sync + 'static,
        options: WatchOptions,
    ) -> Result<WatchHandle> {
        self.watches.register_callback(pattern, callback, options)
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    /// Allocate a snapshot at the current global version.
    pub fn begin_transaction(&self, isolation: IsolationLevel) -> Result<Transaction> {
        self.txns.begin(isolation)
    }

    /// Two-phase commit: prepare (conflict check, validation, WAL intent
    /// with commit marker under one fsync), then commit (advance the
    /// global version, swap cached handles, notify watchers).
    ///
    /// On timeout the transaction aborts before anything durable happens;
    /// it is never left half-applied.
    pub async fn commit_transaction(
        &self,
        mut txn: Transaction,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        if txn.state() != TxnState::Active {
            return Err(Error::Internal {
                message: format!("transaction {} is not active", txn.id()),
            });
        }
        txn.set_state(TxnState::Preparing);
        let deadline = Instant::now() + timeout.unwrap_or(self.txns.default_commit_timeout());

        match self.commit_inner(&mut txn, deadline).await {
            Ok(version) => {
                txn.set_state(TxnState::Committed);
                self.txns.release();
                self.metrics.record_txn_committed();
                Ok(version)
            }
            Err(e) => {
                txn.set_state(TxnState::Aborted);
                self.txns.release();
                if matches!(e, Error::Conflict { .. }) {
                    self.metrics.record_txn_conflict();
                } else {
                    self.metrics.record_txn_aborted();
                }
                Err(e)
            }
        }
    }

    async fn commit_inner(&self, txn: &mut Transaction, deadline: Instant) -> Result<u64> {
        if txn.write_count() == 0 {
            // Nothing to do; read-only transactions commit trivially.
            return Ok(self.txns.current_version());
        }

        let _commit_guard = self.txns.lock_commit().await;

        self.txns.check_conflicts(txn)?;

        for (key, staged) in txn.writes() {
            if let Some(stored) = staged {
                if let Err(e) = self.schema.validate_value(key, &stored.value) {
                    self.metrics.record_validation_failure();
                    return Err(e);
                }
            }
        }

        let writes = txn.take_writes();
        let mut encoded: Vec<(String, Option<Bytes>)> = Vec::with_capacity(writes.len());
        for (key, staged) in &writes {
            let record = match staged {
                Some(stored) => Some(Bytes::from(encode_stored(
                    stored,
                    key.path(),
                    Some(&self.encryptor),
                )?)),
                None => None,
            };
            encoded.push((key.path().to_string(), record));
        }

        // Past this point the WAL batch (writes + commit marker) goes out
        // under a single fsync and the transaction will complete; the
        // timeout only ever aborts before durability.
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                operation: format!("commit of transaction {}", txn.id()),
            });
        }

        if self.is_degraded() {
            return Err(Error::Storage {
                message: "storage degraded; transaction commit rejected".to_string(),
                source: None,
            });
        }
        match self.storage.commit_writes(txn.id(), encoded).await {
            Ok(()) => {}
            Err(e) => {
                if Self::is_storage_failure(&e) {
                    self.enter_degraded(&e);
                }
                return Err(e);
            }
        }

        let hashes: Vec<u64> = writes.keys().map(|k| k.hash64()).collect();
        let version = self.txns.mark_committed(&hashes);

        for (key, staged) in writes {
            match staged {
                Some(stored) => {
                    let value = stored.value.clone();
                    let timestamp_ns = stored.timestamp_ns;
                    self.cache
                        .insert(key.path_arc(), key.hash64(), Arc::new(stored));
                    let _ = self.events_tx.send(ChangeEvent {
                        path: key.path_arc(),
                        value: Some(value),
                        version,
                        timestamp_ns,
                    });
                }
                None => {
                    self.cache.invalidate(key.hash64(), key.path());
                    let _ = self.events_tx.send(ChangeEvent {
                        path: key.path_arc(),
                        value: None,
                        version,
                        timestamp_ns: monotonic_ns(),
                    });
                }
            }
        }

        Ok(version)
    }

    /// Discard a transaction's write-set. Never touches global state.
    pub async fn rollback_transaction(&self, mut txn: Transaction) -> Result<()> {
        let had_writes = txn.write_count() > 0;
        txn.set_state(TxnState::Aborted);
        self.txns.release();
        self.metrics.record_txn_aborted();

        if had_writes && !self.is_degraded() {
            // Best-effort tombstone in the log; recovery ignores the
            // transaction either way since no commit marker exists.
            if let Err(e) = self.storage.abort_txn(txn.id()).await {
                warn!("Failed to log abort for transaction {}: {}", txn.id(), e);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Snapshots and maintenance
    // -----------------------------------------------------------------

    /// Export every live key into the binary snapshot envelope.
    pub async fn export_snapshot(&self) -> Result<Vec<u8>> {
        let entries: Vec<(String, Vec<u8>)> = self
            .storage
            .scan_all()
            .await?
            .into_iter()
            .map(|(path, record)| (path, record.to_vec()))
            .collect();
        write_envelope(self.schema.version(), COMPRESSION_ZSTD, &entries)
    }

    /// Load a snapshot envelope, persisting and caching its entries.
    /// Returns the number of imported keys.
    pub async fn import_snapshot(&self, bytes: &[u8]) -> Result<usize> {
        let envelope = read_envelope(bytes)?;
        let mut imported = 0usize;

        for (hash, path, record) in envelope.entries {
            if !verify_record(&record) {
                return Err(Error::Corruption {
                    key: path,
                    detail: "snapshot record checksum mismatch".to_string(),
                });
            }
            self.storage.put(&path, record.clone(), 0).await?;

            match decode_stored(&record, &path, Some(&self.encryptor)) {
                Ok(stored) => {
                    self.cache.insert(Arc::from(path.as_str()), hash, Arc::new(stored));
                }
                Err(e) => warn!("Imported {} but could not cache it: {}", path, e),
            }
            self.txns.mark_committed(&[hash]);
            imported += 1;
        }
        Ok(imported)
    }

    /// Flush memtables to sorted tables and sync the WAL.
    pub async fn flush(&self) -> Result<()> {
        self.storage.flush_wal().await?;
        self.storage.force_flush().await
    }

    /// Run one compaction round if the tree needs it.
    pub async fn compact(&self) -> Result<()> {
        self.storage.compact_now().await
    }
}
