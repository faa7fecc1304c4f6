//! Versioned serialization of the directory and recency list.
//!
//! The header version observed at open time selects the decoder; the
//! encoder always emits the current layout. Older payloads decode into the
//! current in-memory form with zeroed defaults for absent fields.
//!
//! Layout (all integers little-endian):
//! - `u64` file count; per file: `u32` path length, UTF-8 path bytes, then
//!   `u64` file_size, `u32` block count, and `(i64 index, i64 id,
//!   u64 checksum)` per block;
//! - v2 appends `i64` seconds-precision last-modified;
//! - v3 appends `i64` microseconds-precision last-modified;
//! - trailing recency section: `u64` count, then `i64` ids, MRU first.

use crate::directory::{BlockInfo, Directory, FileMetadata};
use cogstore_block::{ChainRead, ChainWrite};
use cogstore_error::{CacheError, Result};
use cogstore_types::{BlockId, Timestamp};
use std::collections::HashMap;
use tracing::debug;

/// Oldest payload layout this build still decodes.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Layout written by the encoder. Must match `cogstore_block::CURRENT_VERSION`.
pub const CURRENT_VERSION: u32 = 3;

/// Paths beyond this length are treated as corruption rather than
/// allocated.
const MAX_PATH_BYTES: u32 = 1 << 16;

pub fn encode_directory<W: ChainWrite>(dir: &Directory, out: &mut W) -> Result<()> {
    let files = dir.files();
    out.write_u64(files.len() as u64)?;
    for (path, metadata) in files {
        out.write_u32(path.len() as u32)?;
        out.write_all(path.as_bytes())?;
        encode_file(metadata, out)?;
    }

    let lru = dir.lru_ids();
    out.write_u64(lru.len() as u64)?;
    for id in &lru {
        out.write_i64(id.get())?;
    }
    debug!(
        target: "cogstore::meta",
        event = "directory_encode",
        version = CURRENT_VERSION,
        files = files.len(),
        lru_entries = lru.len()
    );
    Ok(())
}

/// Decode a `version` payload into `dir`, replacing its contents.
pub fn decode_directory<R: ChainRead>(dir: &mut Directory, input: &mut R, version: u32) -> Result<()> {
    if !(MIN_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&version) {
        return Err(CacheError::UnsupportedVersion(version));
    }

    let num_files = input.read_u64()?;
    let mut files: HashMap<String, FileMetadata> = HashMap::new();
    for _ in 0..num_files {
        let path_len = input.read_u32()?;
        if path_len > MAX_PATH_BYTES {
            return Err(CacheError::CorruptMetadata(format!(
                "implausible path length {path_len}"
            )));
        }
        let mut raw_path = vec![0_u8; path_len as usize];
        input.read_exact(&mut raw_path)?;
        let path = String::from_utf8(raw_path)
            .map_err(|_| CacheError::CorruptMetadata("file path is not UTF-8".to_owned()))?;
        let metadata = decode_file(input, version)?;
        files.insert(path, metadata);
    }

    let lru_len = input.read_u64()?;
    let mut lru_order = Vec::new();
    for _ in 0..lru_len {
        lru_order.push(BlockId::new(input.read_i64()?));
    }

    debug!(
        target: "cogstore::meta",
        event = "directory_decode",
        version,
        files = files.len(),
        lru_entries = lru_order.len()
    );
    dir.install(files, &lru_order)
}

fn encode_file<W: ChainWrite>(metadata: &FileMetadata, out: &mut W) -> Result<()> {
    out.write_u64(metadata.file_size)?;
    out.write_u32(metadata.blocks.len() as u32)?;
    for info in metadata.blocks.values() {
        out.write_i64(info.block_index)?;
        out.write_i64(info.block_id.get())?;
        out.write_u64(info.checksum)?;
    }
    // The v2 seconds field is derived rather than carried, so second-
    // precision readers of this file still see a truthful timestamp.
    out.write_i64(metadata.last_modified.as_unix_seconds())?;
    out.write_i64(metadata.last_modified.as_micros())?;
    Ok(())
}

fn decode_file<R: ChainRead>(input: &mut R, version: u32) -> Result<FileMetadata> {
    let mut metadata = FileMetadata {
        file_size: input.read_u64()?,
        ..FileMetadata::default()
    };
    let num_blocks = input.read_u32()?;
    for _ in 0..num_blocks {
        let block_index = input.read_i64()?;
        let block_id = BlockId::new(input.read_i64()?);
        let checksum = input.read_u64()?;
        metadata.blocks.insert(
            block_id,
            BlockInfo {
                block_index,
                block_id,
                checksum,
            },
        );
    }

    if version >= 2 {
        metadata.legacy_last_modified = input.read_i64()?;
        if metadata.legacy_last_modified != 0 {
            metadata.last_modified = Timestamp::from_unix_seconds(metadata.legacy_last_modified);
        }
    }
    if version >= 3 {
        metadata.last_modified = Timestamp::from_micros(input.read_i64()?);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> BlockId {
        BlockId::new(raw)
    }

    fn sample_directory() -> Directory {
        let mut dir = Directory::new();
        dir.register("/remote/a.parquet", 0, id(0), 111);
        dir.register("/remote/a.parquet", 1, id(1), 222);
        dir.register("/remote/b.parquet", 7, id(2), 333);
        dir.set_file_size("/remote/a.parquet", 2048);
        dir.set_last_modified("/remote/a.parquet", Timestamp::from_micros(1_700_000_000_123_456));
        dir.set_file_size("/remote/b.parquet", 9999);
        for raw in [0, 1, 2] {
            dir.touch(id(raw));
        }
        dir
    }

    /// Hand-encode one file entry in an old layout.
    fn push_file_v1(out: &mut Vec<u8>, path: &str, file_size: u64, blocks: &[(i64, i64, u64)]) {
        out.extend_from_slice(&(path.len() as u32).to_le_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(&file_size.to_le_bytes());
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        for (index, raw_id, checksum) in blocks {
            out.extend_from_slice(&index.to_le_bytes());
            out.extend_from_slice(&raw_id.to_le_bytes());
            out.extend_from_slice(&checksum.to_le_bytes());
        }
    }

    fn push_lru(out: &mut Vec<u8>, ids: &[i64]) {
        out.extend_from_slice(&(ids.len() as u64).to_le_bytes());
        for raw in ids {
            out.extend_from_slice(&raw.to_le_bytes());
        }
    }

    #[test]
    fn current_version_round_trip() {
        let dir = sample_directory();
        let mut encoded = Vec::new();
        encode_directory(&dir, &mut encoded).unwrap();

        let mut decoded = Directory::new();
        decode_directory(&mut decoded, &mut encoded.as_slice(), CURRENT_VERSION).unwrap();

        assert_eq!(decoded.lookup("/remote/a.parquet", 0), Some(id(0)));
        assert_eq!(decoded.lookup("/remote/a.parquet", 1), Some(id(1)));
        assert_eq!(decoded.lookup("/remote/b.parquet", 7), Some(id(2)));
        let a = decoded.file_metadata("/remote/a.parquet").unwrap();
        assert_eq!(a.file_size, 2048);
        assert_eq!(a.last_modified.as_micros(), 1_700_000_000_123_456);
        assert_eq!(a.blocks[&id(1)].checksum, 222);
        assert_eq!(decoded.lru_ids(), vec![id(2), id(1), id(0)]);
    }

    #[test]
    fn v1_decodes_with_zero_timestamps() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1_u64.to_le_bytes());
        push_file_v1(&mut raw, "/old/file", 512, &[(0, 4, 0xAA), (3, 5, 0xBB)]);
        push_lru(&mut raw, &[5, 4]);

        let mut dir = Directory::new();
        decode_directory(&mut dir, &mut raw.as_slice(), 1).unwrap();
        let md = dir.file_metadata("/old/file").unwrap();
        assert_eq!(md.file_size, 512);
        assert!(md.last_modified.is_zero());
        assert_eq!(md.legacy_last_modified, 0);
        assert_eq!(dir.lookup("/old/file", 3), Some(id(5)));
        assert_eq!(dir.lru_ids(), vec![id(5), id(4)]);
    }

    #[test]
    fn v2_promotes_seconds_timestamp() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1_u64.to_le_bytes());
        push_file_v1(&mut raw, "/old/file", 512, &[(0, 4, 0xAA)]);
        raw.extend_from_slice(&1_600_000_000_i64.to_le_bytes());
        push_lru(&mut raw, &[4]);

        let mut dir = Directory::new();
        decode_directory(&mut dir, &mut raw.as_slice(), 2).unwrap();
        let md = dir.file_metadata("/old/file").unwrap();
        assert_eq!(md.legacy_last_modified, 1_600_000_000);
        assert_eq!(md.last_modified, Timestamp::from_unix_seconds(1_600_000_000));
    }

    #[test]
    fn v3_prefers_microsecond_field() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1_u64.to_le_bytes());
        push_file_v1(&mut raw, "/old/file", 512, &[(0, 4, 0xAA)]);
        raw.extend_from_slice(&1_600_000_000_i64.to_le_bytes());
        raw.extend_from_slice(&1_600_000_000_654_321_i64.to_le_bytes());
        push_lru(&mut raw, &[4]);

        let mut dir = Directory::new();
        decode_directory(&mut dir, &mut raw.as_slice(), 3).unwrap();
        let md = dir.file_metadata("/old/file").unwrap();
        assert_eq!(md.last_modified.as_micros(), 1_600_000_000_654_321);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut dir = Directory::new();
        let raw = 0_u64.to_le_bytes().to_vec();
        let err = decode_directory(&mut dir, &mut raw.as_slice(), 4).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedVersion(4)));
        let err = decode_directory(&mut dir, &mut raw.as_slice(), 0).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedVersion(0)));
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let dir = sample_directory();
        let mut encoded = Vec::new();
        encode_directory(&dir, &mut encoded).unwrap();
        encoded.truncate(encoded.len() - 5);

        let mut decoded = Directory::new();
        let err =
            decode_directory(&mut decoded, &mut encoded.as_slice(), CURRENT_VERSION).unwrap_err();
        assert!(matches!(err, CacheError::CorruptMetadata(_)));
    }

    #[test]
    fn implausible_path_length_is_corrupt() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1_u64.to_le_bytes());
        raw.extend_from_slice(&u32::MAX.to_le_bytes());

        let mut dir = Directory::new();
        let err = decode_directory(&mut dir, &mut raw.as_slice(), 1).unwrap_err();
        assert!(matches!(err, CacheError::CorruptMetadata(_)));
    }
}
