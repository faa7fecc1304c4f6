#![forbid(unsafe_code)]
//! Metadata layer for cogstore.
//!
//! Tracks which blocks of which external files live in which backing-file
//! slots, keeps the LRU recency list the eviction policy runs on, and
//! (de)serializes both through the versioned codec.

mod codec;
mod directory;
mod lru;

pub use codec::{CURRENT_VERSION, MIN_SUPPORTED_VERSION, decode_directory, encode_directory};
pub use directory::{BlockInfo, Directory, FileMetadata};
pub use lru::LruIndex;
