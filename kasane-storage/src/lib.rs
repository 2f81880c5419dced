//! # Kasane Storage
//!
//! Durable, crash-recoverable persistence for configuration values:
//! an append-only write-ahead log in front of an in-memory sorted table,
//! flushed to immutable sorted files that are merged in the background.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Storage Engine                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Write Path:                                                │
//! │  ┌─────────┐    ┌─────────┐    ┌──────────┐                 │
//! │  │  Value  │───>│   WAL   │───>│ MemTable │                 │
//! │  └─────────┘    └─────────┘    └────┬─────┘                 │
//! │                                     │ Flush                 │
//! │                                     ▼                       │
//! │                                ┌──────────┐                 │
//! │                                │ SSTable  │── Compaction ─┐ │
//! │                                └──────────┘ <─────────────┘ │
//! │                                                             │
//! │  Read Path:                                                 │
//! │  ┌─────────┐    ┌──────────┐    ┌──────────────────┐        │
//! │  │  Get    │───>│ MemTable │───>│ SSTables (bloom) │        │
//! │  └─────────┘    └──────────┘    └──────────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use engine::{StorageConfig, StorageEngine};
pub use manifest::{Manifest, SSTableManifestEntry};

/// Marker byte distinguishing live values from tombstones in SSTable
/// values and memtable flush payloads.
pub const KIND_TOMBSTONE: u8 = 0;
pub const KIND_VALUE: u8 = 1;

/// Frame an optional record as an engine value (tombstone when `None`).
pub fn frame_value(record: Option<&[u8]>) -> Vec<u8> {
    match record {
        Some(bytes) => {
            let mut out = Vec::with_capacity(1 + bytes.len());
            out.push(KIND_VALUE);
            out.extend_from_slice(bytes);
            out
        }
        None => vec![KIND_TOMBSTONE],
    }
}

/// Undo [`frame_value`]. Returns `None` for tombstones.
pub fn unframe_value(bytes: &[u8]) -> kasane_core::Result<Option<&[u8]>> {
    match bytes.first() {
        Some(&KIND_VALUE) => Ok(Some(&bytes[1..])),
        Some(&KIND_TOMBSTONE) => Ok(None),
        _ => Err(kasane_core::Error::SSTable {
            message: "empty or unknown engine value framing".to_string(),
            source: None,
        }),
    }
}
