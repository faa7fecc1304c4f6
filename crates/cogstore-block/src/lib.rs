#![forbid(unsafe_code)]
//! Backing-file block layer.
//!
//! One local file holds everything the cache persists: a fixed 4096-byte
//! header region followed by fixed-size block slots. `BlockStore` hands out
//! slot ids, keeps the free list, and persists that free list through the
//! same chained-block streams the directory uses (`chain` module).

use cogstore_error::{CacheError, Result};
use cogstore_types::{
    BlockId, CHAIN_LINK_BYTES, HEADER_RESERVED_BYTES, MIN_BLOCK_SIZE, ParseError, RecordReader,
    STORE_HEADER_SIZE, STORE_MAGIC,
};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

pub mod chain;

pub use chain::{ChainRead, ChainReader, ChainWrite, ChainWriter};

/// On-disk format version written by this build.
pub const CURRENT_VERSION: u32 = 3;

/// Byte-addressed device with pread/pwrite semantics.
///
/// Writes past the current end extend the device; reads past the end fail
/// with `Io`.
pub trait ByteDevice: Send {
    /// Current length in bytes.
    fn len_bytes(&self) -> Result<u64>;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`, extending the device if needed.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed device using `std::os::unix::fs::FileExt`, which is
/// thread-safe and does not share a seek position.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
}

impl FileDevice {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Open an existing file at `path` for read and write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }
}

impl ByteDevice for FileDevice {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── Header ──────────────────────────────────────────────────────────────────

/// Backing-file header, persisted little-endian at offset 0.
///
/// The serialized payload is [`STORE_HEADER_SIZE`] bytes; the region up to
/// [`HEADER_RESERVED_BYTES`] is reserved so the payload can grow without
/// moving block slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u32,
    /// Root of the metadata chain, or `INVALID`.
    pub meta_block: BlockId,
    /// Root of the persisted free-list chain, or `INVALID`.
    pub free_list: BlockId,
    /// Current `max_block`.
    pub block_count: u64,
    pub block_size: u64,
}

impl StoreHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut out = [0_u8; STORE_HEADER_SIZE];
        out[0..8].copy_from_slice(&STORE_MAGIC);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..20].copy_from_slice(&self.meta_block.to_le_bytes());
        out[20..28].copy_from_slice(&self.free_list.to_le_bytes());
        out[28..36].copy_from_slice(&self.block_count.to_le_bytes());
        out[36..44].copy_from_slice(&self.block_size.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = RecordReader::new(data);
        let magic = reader.array::<8>()?;
        if magic != STORE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: STORE_MAGIC,
                actual: magic,
            }
            .into());
        }
        Ok(Self {
            version: reader.u32_le()?,
            meta_block: BlockId::new(reader.i64_le()?),
            free_list: BlockId::new(reader.i64_le()?),
            block_count: reader.u64_le()?,
            block_size: reader.u64_le()?,
        })
    }
}

/// Result of `BlockStore::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    CreatedNew,
    LoadedExisting,
}

/// Block-store configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub block_size: u64,
}

// ── Block store ─────────────────────────────────────────────────────────────

/// Allocator over fixed-size slots in one backing file.
///
/// Invariants: free-list ids are unique and in `[0, max_block)`; `alloc`
/// prefers the smallest free id so slot reuse is deterministic.
pub struct BlockStore {
    device: Option<Box<dyn ByteDevice>>,
    path: Option<PathBuf>,
    block_size: u64,
    max_block: u64,
    free_list: BTreeSet<BlockId>,
    meta_block_id: BlockId,
    free_list_id: BlockId,
    loaded_version: u32,
}

impl BlockStore {
    pub fn new(options: StoreOptions) -> Result<Self> {
        if options.block_size < MIN_BLOCK_SIZE {
            return Err(CacheError::InvalidInput(format!(
                "block size {} below minimum {MIN_BLOCK_SIZE}",
                options.block_size
            )));
        }
        Ok(Self {
            device: None,
            path: None,
            block_size: options.block_size,
            max_block: 0,
            free_list: BTreeSet::new(),
            meta_block_id: BlockId::INVALID,
            free_list_id: BlockId::INVALID,
            loaded_version: CURRENT_VERSION,
        })
    }

    /// Open the backing file at `path`, creating it when absent. A created
    /// file gets a synced header before this returns.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<LoadOutcome> {
        let path = path.as_ref();
        let device: Box<dyn ByteDevice> = if path.exists() {
            Box::new(FileDevice::open(path)?)
        } else {
            Box::new(FileDevice::create(path)?)
        };
        let outcome = self.open_device(device)?;
        self.path = Some(path.to_path_buf());
        info!(
            target: "cogstore::block",
            event = "store_open",
            path = %path.display(),
            created = matches!(outcome, LoadOutcome::CreatedNew),
            block_count = self.max_block,
            free_blocks = self.free_list.len()
        );
        Ok(outcome)
    }

    /// Attach a pre-opened device. An empty device is initialized with a
    /// fresh header; a non-empty one is loaded and validated.
    pub fn open_device(&mut self, device: Box<dyn ByteDevice>) -> Result<LoadOutcome> {
        if self.is_open() {
            self.close()?;
        }

        if device.len_bytes()? == 0 {
            let header = StoreHeader {
                version: CURRENT_VERSION,
                meta_block: BlockId::INVALID,
                free_list: BlockId::INVALID,
                block_count: 0,
                block_size: self.block_size,
            };
            device.write_all_at(0, &header.encode())?;
            device.sync()?;
            self.device = Some(device);
            self.loaded_version = CURRENT_VERSION;
            return Ok(LoadOutcome::CreatedNew);
        }

        let mut raw = [0_u8; STORE_HEADER_SIZE];
        device.read_exact_at(0, &mut raw).map_err(|err| match err {
            CacheError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                CacheError::CorruptHeader("backing file shorter than header".to_owned())
            }
            other => other,
        })?;
        let header = StoreHeader::decode(&raw)?;
        if header.block_size != self.block_size {
            return Err(CacheError::ConfigConflict {
                configured: self.block_size,
                on_disk: header.block_size,
            });
        }

        self.device = Some(device);
        self.max_block = header.block_count;
        self.meta_block_id = header.meta_block;
        self.free_list_id = header.free_list;
        self.loaded_version = header.version;
        if let Err(err) = self.load_free_list() {
            // Do not keep a half-loaded store attached; a later flush would
            // overwrite state we never understood.
            self.reset();
            return Err(err);
        }
        Ok(LoadOutcome::LoadedExisting)
    }

    /// Release the handle and reset in-memory state WITHOUT flushing.
    /// Used when a load fails partway and the on-disk state must be left
    /// exactly as found.
    pub fn discard(&mut self) {
        self.reset();
    }

    /// Persist the free list and header, then release the file handle and
    /// reset in-memory state.
    pub fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.flush()?;
        self.reset();
        Ok(())
    }

    /// Delete the backing file without flushing. In-memory state is reset
    /// whether or not a file existed.
    pub fn clear(&mut self) -> Result<()> {
        let was_open = self.is_open();
        let path = self.path.take();
        self.reset();
        if was_open
            && let Some(path) = path
            && path.exists()
        {
            std::fs::remove_file(&path)?;
            info!(
                target: "cogstore::block",
                event = "store_clear",
                path = %path.display()
            );
        }
        Ok(())
    }

    /// Save the free list and rewrite the header. The header write is
    /// synced; block writes rely on it for ordering.
    pub fn flush(&mut self) -> Result<()> {
        self.require_open()?;
        self.save_free_list()?;
        self.write_header()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// On-disk format version observed at open time. Freshly created files
    /// report [`CURRENT_VERSION`].
    #[must_use]
    pub fn loaded_version(&self) -> u32 {
        self.loaded_version
    }

    #[must_use]
    pub fn max_block(&self) -> u64 {
        self.max_block
    }

    /// Current free set. Inspection only.
    #[must_use]
    pub fn free_list(&self) -> &BTreeSet<BlockId> {
        &self.free_list
    }

    /// Allocate a block id: smallest free id if any, otherwise a fresh slot
    /// past the current end.
    pub fn alloc(&mut self) -> BlockId {
        let id = if let Some(first) = self.free_list.pop_first() {
            first
        } else {
            let id = BlockId::new(self.max_block as i64);
            self.max_block += 1;
            id
        };
        trace!(target: "cogstore::block", event = "block_alloc", block = id.get());
        id
    }

    /// Return `id` to the free set. Freeing an already-free id is a no-op.
    pub fn free(&mut self, id: BlockId) -> Result<()> {
        self.validate_id(id)?;
        if !self.free_list.insert(id) {
            trace!(target: "cogstore::block", event = "block_double_free", block = id.get());
        }
        Ok(())
    }

    /// Walk the chain rooted at `root` and free every visited block.
    /// Returns the number of blocks freed. `INVALID` roots free nothing.
    pub fn free_chain(&mut self, root: BlockId) -> Result<usize> {
        let mut id = root;
        let mut count = 0_usize;
        while id.is_valid() {
            // Chain ids come from stored structures (header pointers and
            // next-links), so an impossible one is on-disk damage rather
            // than caller error.
            if id.index().is_some_and(|index| index >= self.max_block) {
                return Err(CacheError::InvalidBlockId {
                    id: id.get(),
                    reason: "chain link outside the allocated range",
                });
            }
            if count as u64 > self.max_block {
                return Err(CacheError::CorruptMetadata(format!(
                    "metadata chain rooted at {root} exceeds {} blocks; cycle suspected",
                    self.max_block
                )));
            }
            // A chain torn by a failed write ends at the first unreadable
            // link; the readable prefix is still reclaimed.
            let next = match self.read_link(id) {
                Ok(next) => next,
                Err(CacheError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    BlockId::INVALID
                }
                Err(err) => return Err(err),
            };
            self.free(id)?;
            id = next;
            count += 1;
        }
        if count > 0 {
            debug!(
                target: "cogstore::block",
                event = "chain_freed",
                root = root.get(),
                blocks = count
            );
        }
        Ok(count)
    }

    /// Read `buf.len()` bytes (at most one block) from slot `id`.
    pub fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<()> {
        self.validate_id(id)?;
        self.validate_len(buf.len())?;
        let device = self.require_open()?;
        device.read_exact_at(self.block_offset(id), buf)
    }

    /// Write `data` (at most one block) to slot `id`. Shorter payloads
    /// leave the rest of the slot untouched.
    pub fn write_block(&mut self, id: BlockId, data: &[u8]) -> Result<()> {
        self.validate_id(id)?;
        self.validate_len(data.len())?;
        let device = self.require_open()?;
        device.write_all_at(self.block_offset(id), data)
    }

    /// Root of the metadata chain as currently known, `INVALID` when no
    /// flush has happened yet. Does not allocate.
    #[must_use]
    pub fn meta_root(&self) -> BlockId {
        self.meta_block_id
    }

    /// Root block of the metadata chain, allocating and initializing it on
    /// first use.
    pub fn meta_block_id(&mut self) -> Result<BlockId> {
        if self.meta_block_id.is_valid() {
            return Ok(self.meta_block_id);
        }
        let id = self.alloc();
        if let Err(err) = ChainWriter::new(self, id).and_then(ChainWriter::finish) {
            // Roll the allocation back so a later attempt starts clean.
            let _ = self.free(id);
            return Err(err);
        }
        self.meta_block_id = id;
        debug!(target: "cogstore::block", event = "meta_root_created", block = id.get());
        Ok(id)
    }

    // ── Free-list persistence ───────────────────────────────────────────

    /// Persist the free set into a chain of blocks.
    ///
    /// The previous chain is freed first, then every chain block the new
    /// serialization needs is pre-allocated and removed from the set, and
    /// only then is the remaining snapshot written. The persisted set can
    /// therefore never contain a block occupied by its own chain.
    fn save_free_list(&mut self) -> Result<()> {
        self.free_chain(self.free_list_id)?;
        self.free_list_id = BlockId::INVALID;
        if self.free_list.is_empty() {
            return Ok(());
        }

        let payload_per_block = self.block_size - CHAIN_LINK_BYTES;
        let mut chain = vec![self.alloc()];
        loop {
            let needed = 8 + 8 * self.free_list.len() as u64;
            if needed <= chain.len() as u64 * payload_per_block {
                break;
            }
            let next = self.alloc();
            chain.push(next);
        }

        let anchor = chain[0];
        let reserved = chain.split_off(1);
        let snapshot: Vec<BlockId> = self.free_list.iter().copied().collect();
        debug!(
            target: "cogstore::block",
            event = "free_list_save",
            anchor = anchor.get(),
            chain_blocks = reserved.len() + 1,
            entries = snapshot.len()
        );

        let mut writer = ChainWriter::with_reserved(self, anchor, reserved)?;
        writer.write_u64(snapshot.len() as u64)?;
        for id in &snapshot {
            writer.write_i64(id.get())?;
        }
        writer.finish()?;
        self.free_list_id = anchor;
        Ok(())
    }

    fn load_free_list(&mut self) -> Result<()> {
        self.free_list.clear();
        if !self.free_list_id.is_valid() {
            return Ok(());
        }

        let mut reader = ChainReader::new(self, self.free_list_id)?;
        let count = reader.read_u64()?;
        if count > self.max_block {
            return Err(CacheError::CorruptMetadata(format!(
                "persisted free list claims {count} entries with only {} blocks allocated",
                self.max_block
            )));
        }
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(BlockId::new(reader.read_i64()?));
        }
        drop(reader);

        for id in ids {
            if !id.is_valid() || id.index().is_some_and(|i| i >= self.max_block) {
                return Err(CacheError::InvalidBlockId {
                    id: id.get(),
                    reason: "persisted free list id outside the allocated range",
                });
            }
            self.free_list.insert(id);
        }
        debug!(
            target: "cogstore::block",
            event = "free_list_load",
            entries = self.free_list.len()
        );
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn write_header(&mut self) -> Result<()> {
        let header = StoreHeader {
            version: CURRENT_VERSION,
            meta_block: self.meta_block_id,
            free_list: self.free_list_id,
            block_count: self.max_block,
            block_size: self.block_size,
        };
        let device = self.require_open()?;
        device.write_all_at(0, &header.encode())?;
        device.sync()
    }

    fn read_link(&self, id: BlockId) -> Result<BlockId> {
        self.validate_id(id)?;
        let device = self.require_open()?;
        let mut link = [0_u8; 8];
        device.read_exact_at(self.block_offset(id), &mut link)?;
        Ok(BlockId::from_le_bytes(link))
    }

    fn block_offset(&self, id: BlockId) -> u64 {
        // validate_id ran; the index is present.
        let index = id.index().unwrap_or(0);
        HEADER_RESERVED_BYTES + index * self.block_size
    }

    // Out-of-range ids handed in by callers are programming errors, not
    // corruption; they surface as `InvalidInput`.
    fn validate_id(&self, id: BlockId) -> Result<()> {
        let Some(index) = id.index() else {
            return Err(CacheError::InvalidInput(format!(
                "block id {id} is negative or the invalid sentinel"
            )));
        };
        if index >= self.max_block {
            return Err(CacheError::InvalidInput(format!(
                "block id {id} exceeds max block {}",
                self.max_block
            )));
        }
        Ok(())
    }

    fn validate_len(&self, len: usize) -> Result<()> {
        if len as u64 > self.block_size {
            return Err(CacheError::InvalidInput(format!(
                "payload of {len} bytes exceeds block size {}",
                self.block_size
            )));
        }
        Ok(())
    }

    fn require_open(&self) -> Result<&dyn ByteDevice> {
        self.device.as_deref().ok_or(CacheError::NotOpen)
    }

    fn reset(&mut self) {
        self.device = None;
        self.path = None;
        self.max_block = 0;
        self.free_list.clear();
        self.meta_block_id = BlockId::INVALID;
        self.free_list_id = BlockId::INVALID;
        self.loaded_version = CURRENT_VERSION;
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("open", &self.is_open())
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("max_block", &self.max_block)
            .field("free_blocks", &self.free_list.len())
            .field("meta_block_id", &self.meta_block_id)
            .field("free_list_id", &self.free_list_id)
            .finish()
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                target: "cogstore::block",
                event = "store_dropped_open",
                "block store dropped without close; unflushed state is discarded"
            );
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
