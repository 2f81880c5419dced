use bytes::Bytes;
use kasane_core::error::{Error, Result};

pub const WAL_MAGIC: &[u8; 8] = b"KASANEWL";
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 64;
pub const RECORD_HEADER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    /// A key/value write. Payload: path + stored-record bytes.
    Set = 1,

    /// A key removal. Payload: path only.
    Delete = 2,

    /// Marks every earlier record of the same transaction as durable and
    /// applied. Records of a transaction that never reaches this marker
    /// are discarded during recovery.
    TxnCommit = 3,

    /// The transaction was rolled back; its records are dead.
    TxnAbort = 4,

    /// Safe point: everything before this record has been flushed to
    /// sorted tables.
    Checkpoint = 5,
}

impl TryFrom<u64> for WalOp {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            1 => Ok(WalOp::Set),
            2 => Ok(WalOp::Delete),
            3 => Ok(WalOp::TxnCommit),
            4 => Ok(WalOp::TxnAbort),
            5 => Ok(WalOp::Checkpoint),
            _ => Err(Error::WriteAheadLog {
                message: format!("invalid WAL op type: {}", value),
                source: None,
            }),
        }
    }
}

/// A decoded WAL record.
///
/// The on-disk header is exactly 64 bytes: txn id, timestamp (ns), op type,
/// key hash, value size, checksum, previous-record offset of the same
/// transaction (0 = none, chain limited to one file), and flags.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub txn_id: u64,
    pub timestamp_ns: u64,
    pub op: WalOp,
    pub key_hash: u64,
    pub checksum: u64,
    pub prev_offset: u64,
    pub flags: u64,
    /// Key path for Set/Delete; empty for markers.
    pub path: String,
    /// Stored-record bytes for Set; empty otherwise.
    pub record: Bytes,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub max_file_size: u64,
    pub sync_on_write: bool,
    pub buffer_size: usize,
    pub group_commit_delay_us: u64,
    pub max_batch_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_file_size: 64 * 1024 * 1024, // 64MB
            sync_on_write: true,
            buffer_size: 64 * 1024, // 64KB
            group_commit_delay_us: 2000,
            max_batch_size: 256,
        }
    }
}
