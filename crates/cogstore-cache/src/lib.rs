#![forbid(unsafe_code)]
//! Persistent block-cache facade.
//!
//! `Cache` is the single entry point consumers talk to: it coordinates the
//! block store, the metadata directory, and the recency list under one
//! lock, verifies payload checksums on every hit, and persists everything
//! through `flush`. Read-path wrappers keep the cache pinned with the
//! atomic users counter while they hold a handle.

use cogstore_block::{BlockStore, ByteDevice, ChainReader, ChainWriter, LoadOutcome, StoreOptions};
use cogstore_error::{CacheError, Result};
use cogstore_meta::{Directory, decode_directory, encode_directory};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub use cogstore_meta::{BlockInfo, FileMetadata};
pub use cogstore_types::{BlockId, Timestamp};

// The header version and the codec layout are versioned together.
const _: () = assert!(cogstore_block::CURRENT_VERSION == cogstore_meta::CURRENT_VERSION);

/// Cache configuration. The block size is immutable after construction;
/// the byte budget can be changed later with `set_max_bytes`.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub block_size: u64,
    pub max_bytes: u64,
}

impl CacheConfig {
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            max_bytes: u64::MAX,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// Session counters. Hits and misses count `retrieve` outcomes; a checksum
/// mismatch counts as a miss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheInner {
    opened: bool,
    path: Option<PathBuf>,
    store: BlockStore,
    dir: Directory,
    /// Mutation counter since the last flush; zero means clean.
    dirty: u64,
    stats: CacheStats,
}

/// Persistent block-level read cache over one backing file.
///
/// All public operations serialize on one internal lock and hold it for
/// their full duration, I/O included. `close` and `clear` additionally
/// refuse to run while the users counter is nonzero.
pub struct Cache {
    inner: Mutex<CacheInner>,
    users: AtomicU64,
    block_size: u64,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        let store = BlockStore::new(StoreOptions {
            block_size: config.block_size,
        })?;
        let mut dir = Directory::new();
        dir.set_capacity_blocks(config.max_bytes.div_ceil(config.block_size));
        Ok(Self {
            inner: Mutex::new(CacheInner {
                opened: false,
                path: None,
                store,
                dir,
                dirty: 0,
                stats: CacheStats::default(),
            }),
            users: AtomicU64::new(0),
            block_size: config.block_size,
        })
    }

    /// Open the backing file at `path`, creating it when absent. Loading an
    /// existing file restores the directory and recency order persisted by
    /// the last flush. Opening an already-open cache is a no-op.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut inner = self.inner.lock();
        if inner.opened {
            return Ok(());
        }
        if path.as_os_str().is_empty() {
            return Err(CacheError::InvalidInput(
                "cache path can't be empty".to_owned(),
            ));
        }

        let outcome = inner.store.open(path)?;
        if outcome == LoadOutcome::LoadedExisting
            && let Err(err) = Self::load_directory(&mut inner)
        {
            // Leave the on-disk state exactly as found; a later flush from
            // a half-loaded directory would destroy it.
            inner.store.discard();
            inner.dir.clear();
            return Err(err);
        }
        inner.path = Some(path.to_path_buf());
        inner.opened = true;
        // Dirty from the start so the first flush persists a directory even
        // if nothing else changes.
        inner.dirty = 1;
        info!(
            target: "cogstore::cache",
            event = "cache_open",
            path = %path.display(),
            created = outcome == LoadOutcome::CreatedNew,
            blocks = inner.dir.len_blocks(),
            files = inner.dir.num_files()
        );
        Ok(())
    }

    /// Like `open`, but over a caller-supplied device instead of a path.
    /// A cache opened this way has no file to delete on `clear`.
    pub fn open_device(&self, device: Box<dyn ByteDevice>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.opened {
            return Ok(());
        }
        let outcome = inner.store.open_device(device)?;
        if outcome == LoadOutcome::LoadedExisting
            && let Err(err) = Self::load_directory(&mut inner)
        {
            inner.store.discard();
            inner.dir.clear();
            return Err(err);
        }
        inner.opened = true;
        inner.dirty = 1;
        Ok(())
    }

    /// Flush and release the backing file. Fails with `InUse` while any
    /// read-path handle still holds a reference.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.opened {
            return Ok(());
        }
        if self.users.load(Ordering::Acquire) != 0 {
            return Err(CacheError::InUse);
        }
        Self::flush_locked(&mut inner)?;
        inner.store.close()?;
        inner.dir.clear();
        inner.opened = false;
        inner.path = None;
        inner.dirty = 0;
        info!(target: "cogstore::cache", event = "cache_close");
        Ok(())
    }

    /// Drop all cached state and delete the backing file. Fails with
    /// `InUse` while any read-path handle still holds a reference.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.opened {
            if self.users.load(Ordering::Acquire) != 0 {
                return Err(CacheError::InUse);
            }
            inner.store.clear()?;
            inner.dir.clear();
            inner.opened = false;
            inner.path = None;
            info!(target: "cogstore::cache", event = "cache_clear");
        }
        inner.dirty = 0;
        Ok(())
    }

    /// Release every block cached for `path`. Dirties the cache only when
    /// something was actually removed.
    pub fn evict(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;
        let Some(metadata) = inner.dir.file_metadata(path) else {
            return Ok(());
        };

        let mut evicted = false;
        for block_id in metadata.blocks.keys() {
            inner.dir.unregister(*block_id);
            inner.store.free(*block_id)?;
            evicted = true;
        }
        if evicted {
            inner.dirty += 1;
            debug!(
                target: "cogstore::cache",
                event = "file_evict",
                path,
                blocks = metadata.blocks.len()
            );
        }
        Ok(())
    }

    /// Cache `data` as logical block `block_index` of `path`. Re-storing an
    /// existing block overwrites its content and checksum in place.
    pub fn store(&self, path: &str, block_index: i64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;
        if data.len() as u64 > self.block_size {
            return Err(CacheError::InvalidInput(format!(
                "payload of {} bytes exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }

        let checksum = u64::from(crc32c::crc32c(data));
        let inner = &mut *inner;
        let block_id = match inner.dir.lookup(path, block_index) {
            Some(existing) => {
                // Content drift within the validity window: keep the slot,
                // refresh the recorded checksum.
                inner.dir.register(path, block_index, existing, checksum);
                existing
            }
            None => {
                let id = inner.store.alloc();
                inner.dir.register(path, block_index, id, checksum);
                let store = &mut inner.store;
                let evicted = inner.dir.evict_while_oversize(|victim| store.free(victim))?;
                inner.stats.evictions += evicted as u64;
                debug!(
                    target: "cogstore::cache",
                    event = "cache_store_miss",
                    path,
                    block_index,
                    block = id.get(),
                    evicted
                );
                id
            }
        };

        inner.dir.touch(block_id);
        inner.store.write_block(block_id, data)?;
        inner.dirty += 1;
        Ok(())
    }

    /// Fill `out` from the cached block, if present and intact. A checksum
    /// mismatch frees and unregisters the block and reports a miss; the
    /// next `store` re-caches it.
    pub fn retrieve(&self, path: &str, block_index: i64, out: &mut [u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;

        let Some(block_id) = inner.dir.lookup(path, block_index) else {
            inner.stats.misses += 1;
            return Ok(false);
        };
        let info = inner.dir.lookup_block_info(path, block_id)?;
        inner.dir.touch(block_id);
        // A directory entry whose slot was never written (failed store,
        // truncated backing file) reads short; treat it like a checksum
        // mismatch rather than surfacing the I/O error.
        let slot_missing = match inner.store.read_block(block_id, out) {
            Ok(()) => false,
            Err(CacheError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => true,
            Err(err) => return Err(err),
        };

        let computed = u64::from(crc32c::crc32c(out));
        if slot_missing || computed != info.checksum {
            // Backing file and directory disagree; self-heal by dropping
            // the block.
            warn!(
                target: "cogstore::cache",
                event = "checksum_mismatch",
                path,
                block_index,
                block = block_id.get(),
                expected = info.checksum,
                computed
            );
            inner.store.free(block_id)?;
            inner.dir.unregister(block_id);
            inner.dirty += 1;
            inner.stats.misses += 1;
            return Ok(false);
        }

        // Recency moved, which is cache state.
        inner.dirty += 1;
        inner.stats.hits += 1;
        Ok(true)
    }

    /// Record the size observed on the underlying file.
    pub fn store_file_size(&self, path: &str, file_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;
        inner.dir.set_file_size(path, file_size);
        inner.dirty += 1;
        Ok(())
    }

    /// Record the last-modified timestamp observed on the underlying file.
    pub fn store_last_modified(&self, path: &str, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;
        inner.dir.set_last_modified(path, timestamp);
        inner.dirty += 1;
        Ok(())
    }

    /// Snapshot of one file's metadata.
    pub fn file_metadata(&self, path: &str) -> Result<Option<FileMetadata>> {
        let inner = self.inner.lock();
        Self::require_open(&inner)?;
        Ok(inner.dir.file_metadata(path))
    }

    /// Change the byte budget. The capacity is recomputed in blocks and
    /// enforced immediately.
    pub fn set_max_bytes(&self, max_bytes: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;
        let capacity = max_bytes.div_ceil(self.block_size);
        let inner = &mut *inner;
        inner.dir.set_capacity_blocks(capacity);
        let store = &mut inner.store;
        let evicted = inner.dir.evict_while_oversize(|victim| store.free(victim))?;
        inner.stats.evictions += evicted as u64;
        inner.dirty += 1;
        debug!(
            target: "cogstore::cache",
            event = "capacity_change",
            capacity_blocks = capacity,
            evicted
        );
        Ok(())
    }

    /// Persist directory, free list, and header. No-op when clean.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_open(&inner)?;
        Self::flush_locked(&mut inner)
    }

    /// Pin the cache against `close`/`clear`. Prefer `ref_guard`.
    pub fn add_ref(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_ref(&self) {
        let prev = self.users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "remove_ref without matching add_ref");
    }

    /// RAII pin: the counter drops on every exit path, including unwinds,
    /// so a failing handle constructor can't wedge the cache in-use.
    #[must_use]
    pub fn ref_guard(&self) -> CacheRef<'_> {
        self.add_ref();
        CacheRef { cache: self }
    }

    #[must_use]
    pub fn users(&self) -> u64 {
        self.users.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().opened
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty > 0
    }

    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn capacity_blocks(&self) -> u64 {
        self.inner.lock().dir.capacity_blocks()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Recency order as `(path, block_index)` pairs, most-recent first.
    #[must_use]
    pub fn lru_state(&self) -> Vec<(String, i64)> {
        self.inner.lock().dir.lru_state()
    }

    /// Allocator high-water mark. Inspection only.
    #[must_use]
    pub fn max_block(&self) -> u64 {
        self.inner.lock().store.max_block()
    }

    /// Current free-list contents. Inspection only.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<BlockId> {
        self.inner.lock().store.free_list().iter().copied().collect()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn require_open(inner: &CacheInner) -> Result<()> {
        if inner.opened { Ok(()) } else { Err(CacheError::NotOpen) }
    }

    fn load_directory(inner: &mut CacheInner) -> Result<()> {
        let root = inner.store.meta_root();
        if !root.is_valid() {
            // The file was created but never flushed; nothing to restore.
            return Ok(());
        }
        let version = inner.store.loaded_version();
        let mut reader = ChainReader::new(&inner.store, root)?;
        decode_directory(&mut inner.dir, &mut reader, version)
    }

    fn flush_locked(inner: &mut CacheInner) -> Result<()> {
        if inner.dirty == 0 {
            return Ok(());
        }
        let inner = &mut *inner;
        let store = &mut inner.store;

        // The metadata root is stable; recycle the old chain tail before
        // rewriting, so repeated flushes do not grow the file.
        let root = store.meta_block_id()?;
        let tail = ChainReader::new(store, root)?.next_block_id();
        store.free_chain(tail)?;

        let mut writer = ChainWriter::new(store, root)?;
        encode_directory(&inner.dir, &mut writer)?;
        writer.finish()?;

        store.flush()?;
        inner.dirty = 0;
        debug!(
            target: "cogstore::cache",
            event = "cache_flush",
            files = inner.dir.num_files(),
            blocks = inner.dir.len_blocks()
        );
        Ok(())
    }
}

/// Scope guard returned by `Cache::ref_guard`.
pub struct CacheRef<'a> {
    cache: &'a Cache,
}

impl Drop for CacheRef<'_> {
    fn drop(&mut self) {
        self.cache.remove_ref();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
