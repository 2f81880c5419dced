//! # Error Handling
//!
//! Error types for every Kasane operation.
//!
//! ## Design Principles
//!
//! 1. **Contextual**: errors carry the offending key where one exists
//! 2. **Machine-readable**: every error maps to a stable code
//! 3. **Recoverable**: callers can distinguish transient from fatal failures

use thiserror::Error;

/// Result type alias for Kasane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason class attached to validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    TypeMismatch,
    ConstraintViolated,
    UnresolvedDependency,
}

impl ValidationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationKind::TypeMismatch => "type_mismatch",
            ValidationKind::ConstraintViolated => "constraint_violated",
            ValidationKind::UnresolvedDependency => "unresolved_dependency",
        }
    }
}

/// Primary error type for Kasane
#[derive(Error, Debug)]
pub enum Error {
    // Caller-facing errors
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("validation failed for {key} ({})::{message}", kind.as_str())]
    Validation {
        key: String,
        kind: ValidationKind,
        message: String,
    },

    #[error("corruption detected for {key}: {detail}")]
    Corruption { key: String, detail: String },

    #[error("encryption error: {reason}")]
    Encryption { reason: String },

    #[error("transaction {txn_id} conflicts on {key}")]
    Conflict { key: String, txn_id: u64 },

    #[error("resource limit reached: {resource}")]
    ResourceLimit { resource: String },

    #[error("{operation} timed out")]
    Timeout { operation: String },

    // Storage-layer errors
    #[error("storage error: {message}")]
    Storage {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("WAL error: {message}")]
    WriteAheadLog {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("memtable error: {message}")]
    MemTable { message: String },

    #[error("SSTable error: {message}")]
    SSTable {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("compaction failed: {reason}")]
    Compaction { reason: String },

    // System errors
    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Check if the error is worth retrying or degrading around.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ResourceLimit { .. } => true,
            Error::Conflict { .. } => true,
            Error::Storage { .. } => true,
            Error::Io { .. } => true,
            Error::Corruption { .. } => false,
            Error::Encryption { .. } => false,
            _ => true,
        }
    }

    /// Stable code for monitoring and caller dispatch.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Corruption { .. } => "CORRUPTION",
            Error::Encryption { .. } => "ENCRYPTION_ERROR",
            Error::Conflict { .. } => "CONFLICT",
            Error::ResourceLimit { .. } => "RESOURCE_LIMIT",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Storage { .. } => "STORAGE_ERROR",
            Error::WriteAheadLog { .. } => "WAL_ERROR",
            Error::MemTable { .. } => "MEMTABLE_ERROR",
            Error::SSTable { .. } => "SSTABLE_ERROR",
            Error::Compaction { .. } => "COMPACTION_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// The key this error is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Error::NotFound { key }
            | Error::Validation { key, .. }
            | Error::Corruption { key, .. }
            | Error::Conflict { key, .. } => Some(key),
            _ => None,
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Internal {
            message: format!("{}: {}", f(), e),
        })
    }
}
