#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Magic bytes at offset 0 of every backing file.
pub const STORE_MAGIC: [u8; 8] = *b"COGBSTOR";

/// Bytes reserved for the header region regardless of header payload size.
/// Block slot 0 starts at this offset.
pub const HEADER_RESERVED_BYTES: u64 = 4096;

/// Serialized header payload size within the reserved region.
pub const STORE_HEADER_SIZE: usize = 44;

/// Smallest usable block size. Each chain block spends 8 bytes on the next
/// pointer, so anything below this cannot hold a payload.
pub const MIN_BLOCK_SIZE: u64 = 16;

/// Bytes at the start of every chain block reserved for the next-block id.
pub const CHAIN_LINK_BYTES: u64 = 8;

/// Identifier of a fixed-size slot in the backing file.
///
/// Non-negative values index slots; [`BlockId::INVALID`] (-1) is the absent
/// sentinel used in chain links and header pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(i64);

impl BlockId {
    pub const INVALID: Self = Self(-1);

    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Slot index for offset arithmetic, `None` for the sentinel and other
    /// negative values.
    #[must_use]
    pub const fn index(self) -> Option<u64> {
        if self.0 >= 0 {
            Some(self.0 as u64)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(i64::from_le_bytes(bytes))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute timestamp in microseconds since the Unix epoch.
///
/// Zero means "never observed"; version-1 metadata decodes to zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[must_use]
    pub const fn from_unix_seconds(seconds: i64) -> Self {
        Self(seconds.saturating_mul(1_000_000))
    }

    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn as_unix_seconds(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Current wall-clock time, clamped to zero for pre-epoch clocks.
    #[must_use]
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self(micros)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("record truncated: wanted {wanted} bytes at offset {offset}, only {available} left")]
    Truncated {
        wanted: usize,
        offset: usize,
        available: usize,
    },
    #[error("invalid magic: expected {expected:02x?}, got {actual:02x?}")]
    InvalidMagic { expected: [u8; 8], actual: [u8; 8] },
}

/// Sequential reader over a fixed-layout on-disk record.
///
/// Records are decoded the way they were written: field by field, in
/// order, little-endian. Running past the end reports how far the record
/// actually reached.
#[derive(Debug)]
pub struct RecordReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let bytes = self.take(N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u32_le(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    pub fn u64_le(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    pub fn i64_le(&mut self) -> Result<i64, ParseError> {
        Ok(i64::from_le_bytes(self.array::<8>()?))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if len > self.remaining() {
            return Err(ParseError::Truncated {
                wanted: len,
                offset: self.offset,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }
}
