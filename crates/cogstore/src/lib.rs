#![forbid(unsafe_code)]
//! cogstore public API facade.
//!
//! Re-exports the cache facade and the types read-path integrations need.
//! Downstream consumers (database VFS glue, admin surfaces) depend on this
//! crate rather than the internals.

pub use cogstore_block::{BlockStore, ByteDevice, FileDevice, LoadOutcome, StoreOptions};
pub use cogstore_cache::{Cache, CacheConfig, CacheRef, CacheStats};
pub use cogstore_error::{CacheError, Result};
pub use cogstore_meta::{BlockInfo, FileMetadata};
pub use cogstore_types::{BlockId, Timestamp};
