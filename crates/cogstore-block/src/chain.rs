//! Byte-granular streams over linked block chains.
//!
//! Every chain block reserves its first 8 bytes for the next block's id
//! (little-endian, `-1` terminates the chain); the rest is payload. Chains
//! carry no length prefix; callers encode their own counts.

use crate::BlockStore;
use cogstore_error::{CacheError, Result};
use cogstore_types::{BlockId, CHAIN_LINK_BYTES};
use tracing::trace;

const LINK: usize = CHAIN_LINK_BYTES as usize;

/// Byte sink with little-endian integer helpers.
pub trait ChainWrite {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }
}

/// Byte source with little-endian integer helpers.
///
/// `read` fills as much of `out` as the stream still holds; `read_exact`
/// turns a short read into `CorruptMetadata`.
pub trait ChainRead {
    fn read(&mut self, out: &mut [u8]) -> Result<usize>;

    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let n = self.read(out)?;
        if n < out.len() {
            return Err(CacheError::CorruptMetadata(format!(
                "unexpected end of metadata stream: wanted {} bytes, got {n}",
                out.len()
            )));
        }
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0_u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0_u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0_u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }
}

impl ChainWrite for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl ChainRead for &[u8] {
    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        let slice = *self;
        let n = out.len().min(slice.len());
        out[..n].copy_from_slice(&slice[..n]);
        *self = &slice[n..];
        Ok(n)
    }
}

/// Writer over a block chain anchored at a fixed root id.
///
/// The current block is buffered in memory and written out when the buffer
/// fills or on `finish`. Continuation blocks come from `reserved` first,
/// then from the allocator. Callers MUST call `finish`; Drop only performs
/// a best-effort flush of the tail block and swallows errors.
#[derive(Debug)]
pub struct ChainWriter<'a> {
    store: &'a mut BlockStore,
    current_id: BlockId,
    buf: Vec<u8>,
    offset: usize,
    reserved: Vec<BlockId>,
    finished: bool,
}

impl<'a> ChainWriter<'a> {
    pub fn new(store: &'a mut BlockStore, anchor: BlockId) -> Result<Self> {
        Self::with_reserved(store, anchor, Vec::new())
    }

    /// Like `new`, but continuation blocks are taken from `reserved`
    /// (front first) before falling back to the allocator. The free-list
    /// writer uses this so that serializing the free list never allocates
    /// from the set being serialized.
    pub fn with_reserved(
        store: &'a mut BlockStore,
        anchor: BlockId,
        mut reserved: Vec<BlockId>,
    ) -> Result<Self> {
        if !anchor.is_valid() {
            return Err(CacheError::InvalidInput(format!(
                "chain writer anchor {anchor} is not a valid block id"
            )));
        }
        reserved.reverse(); // take from the back
        let block_size = store.block_size() as usize;
        let mut buf = vec![0xFF_u8; block_size];
        buf[..LINK].copy_from_slice(&BlockId::INVALID.to_le_bytes());
        Ok(Self {
            store,
            current_id: anchor,
            buf,
            offset: LINK,
            reserved,
            finished: false,
        })
    }

    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            if self.offset == self.buf.len() {
                self.extend_chain()?;
            }
            let space = self.buf.len() - self.offset;
            let chunk = space.min(bytes.len());
            self.buf[self.offset..self.offset + chunk].copy_from_slice(&bytes[..chunk]);
            self.offset += chunk;
            bytes = &bytes[chunk..];
        }
        Ok(())
    }

    /// Flush the tail block. Consumes the writer; the chain is complete
    /// once this returns. Reserved blocks the payload never reached are
    /// linked in as empty tail blocks, so every pre-allocated id stays
    /// reachable from the anchor and a later `free_chain` reclaims it.
    pub fn finish(mut self) -> Result<()> {
        while !self.reserved.is_empty() {
            self.extend_chain()?;
        }
        self.store.write_block(self.current_id, &self.buf)?;
        self.finished = true;
        Ok(())
    }

    fn extend_chain(&mut self) -> Result<()> {
        let next_id = match self.reserved.pop() {
            Some(id) => id,
            None => self.store.alloc(),
        };
        self.buf[..LINK].copy_from_slice(&next_id.to_le_bytes());
        self.store.write_block(self.current_id, &self.buf)?;
        trace!(
            target: "cogstore::chain",
            event = "chain_extend",
            from = self.current_id.get(),
            to = next_id.get()
        );

        self.buf.fill(0xFF);
        self.buf[..LINK].copy_from_slice(&BlockId::INVALID.to_le_bytes());
        self.offset = LINK;
        self.current_id = next_id;
        Ok(())
    }
}

impl ChainWrite for ChainWriter<'_> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_bytes(bytes)
    }
}

impl Drop for ChainWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.store.write_block(self.current_id, &self.buf);
        }
    }
}

/// Reader over a block chain. The next block is loaded lazily when the
/// current payload is exhausted.
pub struct ChainReader<'a> {
    store: &'a BlockStore,
    buf: Vec<u8>,
    offset: usize,
    exhausted: bool,
}

impl<'a> ChainReader<'a> {
    pub fn new(store: &'a BlockStore, start: BlockId) -> Result<Self> {
        let block_size = store.block_size() as usize;
        let mut reader = Self {
            store,
            buf: vec![0xFF_u8; block_size],
            offset: block_size,
            exhausted: true,
        };
        if start.is_valid() {
            reader.load_block(start)?;
        }
        Ok(reader)
    }

    /// Next-block id recorded in the currently loaded block.
    #[must_use]
    pub fn next_block_id(&self) -> BlockId {
        let mut link = [0_u8; 8];
        link.copy_from_slice(&self.buf[..LINK]);
        BlockId::from_le_bytes(link)
    }

    fn load_block(&mut self, id: BlockId) -> Result<()> {
        self.store.read_block(id, &mut self.buf)?;
        self.offset = LINK;
        self.exhausted = false;
        Ok(())
    }

    fn read_bytes(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < out.len() {
            if self.offset == self.buf.len() {
                let next = self.next_block_id();
                if !next.is_valid() {
                    self.exhausted = true;
                    break;
                }
                self.load_block(next)?;
            }
            if self.exhausted {
                break;
            }
            let avail = self.buf.len() - self.offset;
            let chunk = avail.min(out.len() - filled);
            out[filled..filled + chunk].copy_from_slice(&self.buf[self.offset..self.offset + chunk]);
            self.offset += chunk;
            filled += chunk;
        }
        Ok(filled)
    }
}

impl ChainRead for ChainReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.read_bytes(out)
    }
}
