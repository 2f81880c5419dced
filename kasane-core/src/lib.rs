//! # Kasane Core
//!
//! Fundamental building blocks shared by every Kasane crate:
//! - Typed configuration keys and values
//! - The fixed binary value codec and snapshot envelope
//! - Checksums, AEAD encryption and key providers
//! - The schema compiler and validator
//! - Error types and metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   kasane-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • types      - ConfigKey / ConfigValue         │
//! │  • serialize  - value codec + snapshot envelope │
//! │  • crypto     - checksums, AEAD, key providers  │
//! │  • schema     - compiled validation pipeline    │
//! │  • pattern    - glob matching for keys/values   │
//! │  • error      - error taxonomy                  │
//! │  • metrics    - atomic counters                 │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod crypto;
pub mod error;
pub mod metrics;
pub mod pattern;
pub mod schema;
pub mod serialize;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result, ValidationKind};
pub use types::{ConfigKey, ConfigValue, KeyFlags, StoredValue, TypeTag};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// On-disk format version shared by the envelope, WAL and SSTables.
pub const FORMAT_VERSION: u32 = 1;
