#![forbid(unsafe_code)]
//! Error types for cogstore.
//!
//! Defines `CacheError` and a `Result<T>` alias used throughout the
//! workspace. One variant exists per failure class at the core boundary.

use cogstore_types::ParseError;
use thiserror::Error;

/// Unified error type for all cogstore operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt backing-file header: {0}")]
    CorruptHeader(String),

    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("block size mismatch: configured {configured}, backing file has {on_disk}")]
    ConfigConflict { configured: u64, on_disk: u64 },

    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u32),

    /// A stored structure (header pointer, chain link, persisted free
    /// list) names a block outside the allocated range. Out-of-range ids
    /// supplied by callers are `InvalidInput` instead.
    #[error("stored block id {id} is invalid: {reason}")]
    InvalidBlockId { id: i64, reason: &'static str },

    #[error("cache is in use, wait for outstanding readers to finish and retry")]
    InUse,

    #[error("cache is not open")]
    NotOpen,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<ParseError> for CacheError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidMagic { .. } => Self::CorruptHeader(err.to_string()),
            _ => Self::CorruptMetadata(err.to_string()),
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
