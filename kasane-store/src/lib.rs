//! # Kasane Store
//!
//! The public face of Kasane: a concurrent, transactional configuration
//! store combining the cache hierarchy, the persistent engine, schema
//! validation and change notification behind one manager.
//!
//! ```text
//! caller ──► ConfigStore ──► Validator (writes)
//!                │
//!                ├──► Cache L1/L2/L3 ──► miss ──► Storage Engine
//!                │
//!                └──► change events ──► watchers (async dispatch)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use kasane_core::types::ConfigValue;
//! use kasane_store::{ConfigStore, SetOptions, StoreOptions};
//!
//! # async fn demo() -> kasane_core::Result<()> {
//! let store = ConfigStore::open(StoreOptions::new("./config-data")).await?;
//!
//! store
//!     .set_value("display.brightness", ConfigValue::U32(70), SetOptions::default())
//!     .await?;
//! let value = store.get_value("display.brightness", None).await?;
//! assert_eq!(value, ConfigValue::U32(70));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod txn;
pub mod watch;

pub use config::StoreOptions;
pub use manager::{ConfigStore, InitPhase, SetOptions};
pub use txn::{IsolationLevel, Transaction, TxnConfig, TxnState};
pub use watch::{ChangeEvent, WatchConfig, WatchHandle, WatchOptions};
