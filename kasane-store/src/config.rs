//! Store construction options.
//!
//! Owned by the bootstrap layer and passed in; the store never reads
//! ambient global state.

use std::path::{Path, PathBuf};

use kasane_cache::CacheConfig;
use kasane_core::crypto::KeySource;
use kasane_storage::StorageConfig;

use crate::txn::TxnConfig;
use crate::watch::WatchConfig;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    /// Overall memory budget; `new` derives the cache geometry from it.
    pub memory_pool_bytes: usize,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub txn: TxnConfig,
    pub watch: WatchConfig,
    /// JSON schema document compiled at startup; `None` accepts anything.
    pub schema_path: Option<PathBuf>,
    pub key_source: KeySource,
}

impl StoreOptions {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let storage = StorageConfig {
            data_dir: data_dir.clone(),
            ..Default::default()
        };
        Self {
            data_dir,
            memory_pool_bytes: 32 * 1024 * 1024, // 32MB
            cache: CacheConfig::default(),
            storage,
            txn: TxnConfig::default(),
            watch: WatchConfig::default(),
            schema_path: None,
            key_source: KeySource::Ephemeral,
        }
    }

    /// Scale the cache levels to a memory budget: L3 takes half of it,
    /// L1/L2 geometry grows with the rest.
    pub fn with_memory_pool(mut self, bytes: usize) -> Self {
        let bytes = bytes.max(1024 * 1024);
        self.memory_pool_bytes = bytes;
        self.cache.l3_max_bytes = bytes / 2;
        self.cache.l1_slots = (bytes / 32_768).clamp(256, 16_384);
        self.cache.l2_sets = (self.cache.l1_slots / 4).max(64);
        self
    }

    pub fn with_schema(mut self, path: impl AsRef<Path>) -> Self {
        self.schema_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_key_source(mut self, source: KeySource) -> Self {
        self.key_source = source;
        self
    }
}
