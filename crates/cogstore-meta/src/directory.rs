//! Metadata directory: which external file blocks live in which slots.
//!
//! Three coupled indices are mutated together under the cache lock: the
//! forward map `(path, block_index) → block_id`, the reverse map
//! `block_id → (path, block_index)`, and per-file metadata. The recency
//! list rides along so eviction decisions survive restarts.

use crate::lru::LruIndex;
use cogstore_error::{CacheError, Result};
use cogstore_types::{BlockId, Timestamp};
use std::collections::HashMap;
use tracing::trace;

/// Where one logical block of an external file is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Logical index on the external file (`offset / block_size`).
    pub block_index: i64,
    /// Slot in the backing file. Always equals the key this record is
    /// stored under.
    pub block_id: BlockId,
    /// Fingerprint of the stored payload, verified on every retrieve.
    pub checksum: u64,
}

/// Per-external-file attributes and block set.
#[derive(Debug, Clone, Default)]
pub struct FileMetadata {
    /// Size observed on the underlying file, not the cached byte count.
    pub file_size: u64,
    /// Second-precision timestamp carried by version-2 metadata.
    pub legacy_last_modified: i64,
    pub last_modified: Timestamp,
    pub blocks: HashMap<BlockId, BlockInfo>,
}

/// Forward/reverse/per-file indices plus the recency list.
#[derive(Debug, Default)]
pub struct Directory {
    forward: HashMap<(String, i64), BlockId>,
    reverse: HashMap<BlockId, (String, i64)>,
    files: HashMap<String, FileMetadata>,
    lru: LruIndex,
    /// Capacity in blocks; entries beyond it are evicted tail-first.
    capacity_blocks: u64,
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity_blocks: u64::MAX,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn lookup(&self, path: &str, block_index: i64) -> Option<BlockId> {
        self.forward.get(&(path.to_owned(), block_index)).copied()
    }

    /// Record that `(path, block_index)` is cached at `block_id`, updating
    /// all three indices and creating the file entry when absent.
    pub fn register(&mut self, path: &str, block_index: i64, block_id: BlockId, checksum: u64) {
        let key = (path.to_owned(), block_index);
        self.reverse.insert(block_id, key.clone());
        self.forward.insert(key, block_id);
        let file = self.files.entry(path.to_owned()).or_default();
        file.blocks.insert(
            block_id,
            BlockInfo {
                block_index,
                block_id,
                checksum,
            },
        );
        trace!(
            target: "cogstore::meta",
            event = "block_register",
            path,
            block_index,
            block = block_id.get()
        );
    }

    /// Drop every trace of `block_id`: reverse map, the owning file's block
    /// set (and the file entry itself once empty), forward map, and the
    /// recency list. Returns whether the id was registered.
    pub fn unregister(&mut self, block_id: BlockId) -> bool {
        let removed = if let Some(key) = self.reverse.remove(&block_id) {
            if let Some(file) = self.files.get_mut(&key.0) {
                file.blocks.remove(&block_id);
                if file.blocks.is_empty() {
                    self.files.remove(&key.0);
                }
            }
            self.forward.remove(&key);
            true
        } else {
            false
        };
        self.lru.remove(block_id);
        removed
    }

    pub fn set_file_size(&mut self, path: &str, file_size: u64) {
        self.files.entry(path.to_owned()).or_default().file_size = file_size;
    }

    pub fn set_last_modified(&mut self, path: &str, timestamp: Timestamp) {
        self.files
            .entry(path.to_owned())
            .or_default()
            .last_modified = timestamp;
    }

    /// Snapshot copy of one file's metadata.
    #[must_use]
    pub fn file_metadata(&self, path: &str) -> Option<FileMetadata> {
        self.files.get(path).cloned()
    }

    /// Checksum record for a block the forward map already resolved. A miss
    /// here means the indices disagree.
    pub fn lookup_block_info(&self, path: &str, block_id: BlockId) -> Result<BlockInfo> {
        self.files
            .get(path)
            .and_then(|file| file.blocks.get(&block_id))
            .copied()
            .ok_or_else(|| {
                CacheError::CorruptMetadata(format!(
                    "no block record for {path} at block {block_id}"
                ))
            })
    }

    pub fn touch(&mut self, block_id: BlockId) {
        self.lru.touch(block_id);
    }

    /// Evict least-recent blocks until the list fits the capacity. The
    /// callback releases the slot in the allocator before the directory
    /// entry goes away.
    pub fn evict_while_oversize(
        &mut self,
        mut release: impl FnMut(BlockId) -> Result<()>,
    ) -> Result<usize> {
        let mut evicted = 0_usize;
        while self.lru.len() as u64 > self.capacity_blocks {
            let Some(victim) = self.lru.tail() else {
                break;
            };
            release(victim)?;
            self.unregister(victim);
            evicted += 1;
            trace!(target: "cogstore::meta", event = "lru_evict", block = victim.get());
        }
        Ok(evicted)
    }

    pub fn set_capacity_blocks(&mut self, capacity: u64) {
        self.capacity_blocks = capacity;
    }

    #[must_use]
    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    /// Number of tracked blocks.
    #[must_use]
    pub fn len_blocks(&self) -> usize {
        self.lru.len()
    }

    #[must_use]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
        self.files.clear();
        self.lru.clear();
    }

    /// Recency order as `(path, block_index)` pairs, most-recent first.
    /// Ids without a reverse entry are skipped.
    #[must_use]
    pub fn lru_state(&self) -> Vec<(String, i64)> {
        self.lru
            .iter()
            .filter_map(|id| self.reverse.get(&id).cloned())
            .collect()
    }

    /// Recency order as block ids, most-recent first.
    #[must_use]
    pub fn lru_ids(&self) -> Vec<BlockId> {
        self.lru.iter().collect()
    }

    pub(crate) fn files(&self) -> &HashMap<String, FileMetadata> {
        &self.files
    }

    /// Replace all state with decoded metadata, rebuilding the forward and
    /// reverse maps from the per-file block sets and the recency list from
    /// `lru_order` (most-recent first). Capacity is preserved.
    pub(crate) fn install(
        &mut self,
        files: HashMap<String, FileMetadata>,
        lru_order: &[BlockId],
    ) -> Result<()> {
        self.clear();
        for (path, metadata) in &files {
            for info in metadata.blocks.values() {
                let key = (path.clone(), info.block_index);
                if self.reverse.insert(info.block_id, key.clone()).is_some() {
                    return Err(CacheError::CorruptMetadata(format!(
                        "block {} referenced by more than one file entry",
                        info.block_id
                    )));
                }
                self.forward.insert(key, info.block_id);
            }
        }
        self.files = files;
        for id in lru_order {
            self.lru.push_back(*id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> BlockId {
        BlockId::new(raw)
    }

    #[test]
    fn register_updates_all_indices() {
        let mut dir = Directory::new();
        dir.register("/data/a.parquet", 4, id(9), 0xFEED);

        assert_eq!(dir.lookup("/data/a.parquet", 4), Some(id(9)));
        let md = dir.file_metadata("/data/a.parquet").unwrap();
        assert_eq!(md.blocks[&id(9)].block_index, 4);
        assert_eq!(md.blocks[&id(9)].checksum, 0xFEED);
        let info = dir.lookup_block_info("/data/a.parquet", id(9)).unwrap();
        assert_eq!(info.block_id, id(9));
    }

    #[test]
    fn unregister_removes_empty_file_entry() {
        let mut dir = Directory::new();
        dir.register("/f", 0, id(1), 1);
        dir.register("/f", 1, id(2), 2);
        dir.touch(id(1));
        dir.touch(id(2));

        assert!(dir.unregister(id(1)));
        assert_eq!(dir.lookup("/f", 0), None);
        assert_eq!(dir.lookup("/f", 1), Some(id(2)));
        assert!(dir.file_metadata("/f").is_some());

        assert!(dir.unregister(id(2)));
        assert!(dir.file_metadata("/f").is_none());
        assert_eq!(dir.len_blocks(), 0);

        assert!(!dir.unregister(id(2)));
    }

    #[test]
    fn lookup_block_info_detects_disagreement() {
        let mut dir = Directory::new();
        dir.register("/f", 0, id(1), 1);
        let err = dir.lookup_block_info("/f", id(5)).unwrap_err();
        assert!(matches!(err, CacheError::CorruptMetadata(_)));
    }

    #[test]
    fn eviction_respects_recency() {
        let mut dir = Directory::new();
        for raw in 0..5 {
            dir.register("/f", raw, id(raw), 0);
            dir.touch(id(raw));
        }
        dir.touch(id(0)); // protect the oldest
        dir.set_capacity_blocks(3);

        let mut released = Vec::new();
        let evicted = dir
            .evict_while_oversize(|victim| {
                released.push(victim.get());
                Ok(())
            })
            .unwrap();
        assert_eq!(evicted, 2);
        assert_eq!(released, vec![1, 2]);
        assert_eq!(dir.lookup("/f", 0), Some(id(0)));
        assert_eq!(dir.lookup("/f", 1), None);
        assert_eq!(dir.len_blocks(), 3);
    }

    #[test]
    fn file_attributes_upsert_without_blocks() {
        let mut dir = Directory::new();
        dir.set_file_size("/f", 4096);
        dir.set_last_modified("/f", Timestamp::from_unix_seconds(99));
        let md = dir.file_metadata("/f").unwrap();
        assert_eq!(md.file_size, 4096);
        assert_eq!(md.last_modified.as_unix_seconds(), 99);
        assert!(md.blocks.is_empty());
    }

    #[test]
    fn install_rejects_shared_block_ids() {
        let mut files: HashMap<String, FileMetadata> = HashMap::new();
        for path in ["/a", "/b"] {
            let mut md = FileMetadata::default();
            md.blocks.insert(
                id(3),
                BlockInfo {
                    block_index: 0,
                    block_id: id(3),
                    checksum: 0,
                },
            );
            files.insert(path.to_owned(), md);
        }
        let mut dir = Directory::new();
        let err = dir.install(files, &[]).unwrap_err();
        assert!(matches!(err, CacheError::CorruptMetadata(_)));
    }
}
