//! Sorted runs: the on-disk layout of every database, the catalog and the
//! free list.
//!
//! ```text
//! count u64 | offsets u64[count] | (klen u32, key, vlen u32, val)*
//! ```
//!
//! Offsets are relative to the start of the run. Keys are strictly
//! ascending by bytes, so lookups binary-search the offsets table in place,
//! straight out of the memory map.

use std::cmp::Ordering;

use crate::constants::PAGE_SIZE;
use crate::error::{Error, Result};

const COUNT_SIZE: usize = 8;
const OFFSET_SIZE: usize = 8;
const LEN_SIZE: usize = 4;

/// Location of a run on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RunPtr {
    /// First page, 0 for an empty run
    pub pgno: u64,
    /// Length in bytes
    pub len: u64,
    /// CRC32 of the run bytes
    pub crc: u32,
}

impl RunPtr {
    pub const ENCODED_SIZE: usize = 20;

    pub fn is_empty(&self) -> bool {
        self.pgno == 0
    }

    pub fn pages(&self) -> u64 {
        pages_for(self.len as usize)
    }

    pub fn offset(&self) -> usize {
        self.pgno as usize * PAGE_SIZE
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.pgno.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&self.crc.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(Error::Corrupted("short run pointer"));
        }
        Ok(RunPtr {
            pgno: read_u64(buf, 0),
            len: read_u64(buf, 8),
            crc: read_u32(buf, 16),
        })
    }
}

/// Pages needed to hold `len` bytes
pub(crate) fn pages_for(len: usize) -> u64 {
    len.div_ceil(PAGE_SIZE) as u64
}

/// Encoded size of a run holding `count` entries with `payload` key+value bytes
pub(crate) fn run_size(count: usize, payload: usize) -> usize {
    COUNT_SIZE + count * (OFFSET_SIZE + 2 * LEN_SIZE) + payload
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Borrowed view over an encoded run
#[derive(Debug, Clone, Copy)]
pub(crate) struct Run<'a> {
    data: &'a [u8],
    count: usize,
}

impl<'a> Run<'a> {
    pub const EMPTY: Run<'static> = Run { data: &[], count: 0 };

    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Run { data, count: 0 });
        }
        if data.len() < COUNT_SIZE {
            return Err(Error::Corrupted("run header truncated"));
        }
        let count = usize::try_from(read_u64(data, 0))
            .map_err(|_| Error::Corrupted("run entry count"))?;
        let table_end = count
            .checked_mul(OFFSET_SIZE)
            .and_then(|n| n.checked_add(COUNT_SIZE))
            .ok_or(Error::Corrupted("run entry count"))?;
        if table_end > data.len() {
            return Err(Error::Corrupted("run offsets truncated"));
        }
        Ok(Run { data, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn slice(&self, at: usize) -> Result<(&'a [u8], usize)> {
        let data = self.data;
        let end = at
            .checked_add(LEN_SIZE)
            .filter(|end| *end <= data.len())
            .ok_or(Error::Corrupted("run entry out of bounds"))?;
        let len = read_u32(data, at) as usize;
        let stop = end
            .checked_add(len)
            .filter(|stop| *stop <= data.len())
            .ok_or(Error::Corrupted("run entry out of bounds"))?;
        Ok((&data[end..stop], stop))
    }

    fn entry_offset(&self, index: usize) -> usize {
        read_u64(self.data, COUNT_SIZE + index * OFFSET_SIZE) as usize
    }

    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        debug_assert!(index < self.count);
        self.slice(self.entry_offset(index)).map(|(key, _)| key)
    }

    pub fn entry(&self, index: usize) -> Result<(&'a [u8], &'a [u8])> {
        debug_assert!(index < self.count);
        let (key, next) = self.slice(self.entry_offset(index))?;
        let (value, _) = self.slice(next)?;
        Ok((key, value))
    }

    /// `Ok(i)` when `key` sits at `i`, `Err(i)` with its insertion point otherwise
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let mut left = 0;
        let mut right = self.count;
        while left < right {
            let mid = left + (right - left) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => left = mid + 1,
                Ordering::Greater => right = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(left))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        match self.search(key)? {
            Ok(index) => self.entry(index).map(|(_, value)| Some(value)),
            Err(_) => Ok(None),
        }
    }

    /// Index of the first key strictly greater than `key`
    pub fn upper_bound(&self, key: &[u8]) -> Result<usize> {
        Ok(match self.search(key)? {
            Ok(index) => index + 1,
            Err(index) => index,
        })
    }

    /// Index of the first key greater than or equal to `key`
    pub fn lower_bound(&self, key: &[u8]) -> Result<usize> {
        Ok(match self.search(key)? {
            Ok(index) | Err(index) => index,
        })
    }
}

/// Builds a run from entries pushed in ascending key order
#[derive(Debug, Default)]
pub(crate) struct RunWriter {
    offsets: Vec<u64>,
    body: Vec<u8>,
    last_key: Option<Vec<u8>>,
}

impl RunWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn push(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let klen = u32::try_from(key.len()).map_err(|_| Error::BadValSize(key.len()))?;
        let vlen = u32::try_from(value.len()).map_err(|_| Error::BadValSize(value.len()))?;
        debug_assert!(
            self.last_key.as_deref().map_or(true, |last| last < key),
            "run keys must be strictly ascending"
        );
        self.offsets.push(self.body.len() as u64);
        self.body.extend_from_slice(&klen.to_le_bytes());
        self.body.extend_from_slice(key);
        self.body.extend_from_slice(&vlen.to_le_bytes());
        self.body.extend_from_slice(value);
        if cfg!(debug_assertions) {
            self.last_key = Some(key.to_vec());
        }
        Ok(())
    }

    /// Encoded bytes; empty when no entry was pushed
    pub fn finish(self) -> Vec<u8> {
        if self.offsets.is_empty() {
            return Vec::new();
        }
        let header = COUNT_SIZE + self.offsets.len() * OFFSET_SIZE;
        let mut out = Vec::with_capacity(header + self.body.len());
        out.extend_from_slice(&(self.offsets.len() as u64).to_le_bytes());
        for offset in &self.offsets {
            out.extend_from_slice(&(offset + header as u64).to_le_bytes());
        }
        out.extend_from_slice(&self.body);
        out
    }
}
