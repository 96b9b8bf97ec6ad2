use crate::constants::{MDB_MAGIC, MDB_VERSION, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::page::{read_u32, read_u64, RunPtr};
use crate::types::DbKind;

/// Bytes of a meta page actually in use, checksum included
pub(crate) const META_SIZE: usize = 76;
const CRC_AT: usize = META_SIZE - 4;

/// Meta header, one per meta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying a cache file
    pub(crate) magic: u32,
    /// Version number
    pub(crate) version: u32,
    /// Page size for this file
    pub(crate) page_size: u32,
    /// txnid that committed this page
    pub(crate) txnid: u64,
    /// First page never handed out
    pub(crate) last_pgno: u64,
    /// Name -> database record
    pub(crate) catalog: RunPtr,
    /// Free extents
    pub(crate) free: RunPtr,
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self {
            magic: MDB_MAGIC,
            version: MDB_VERSION,
            page_size: PAGE_SIZE as u32,
            txnid: 0,
            last_pgno: META_PAGES as u64,
            catalog: RunPtr::default(),
            free: RunPtr::default(),
        }
    }
}

impl MetaHeader {
    /// Meta slot this header is written to
    pub(crate) fn slot(&self) -> usize {
        (self.txnid & 1) as usize
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_SIZE);
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.page_size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.txnid.to_le_bytes());
        buf.extend_from_slice(&self.last_pgno.to_le_bytes());
        self.catalog.encode_into(&mut buf);
        self.free.encode_into(&mut buf);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(buf.len(), META_SIZE);
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::Invalid);
        }
        let magic = read_u32(buf, 0);
        if magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        let version = read_u32(buf, 4);
        if version != MDB_VERSION {
            return Err(Error::VersionMismatch {
                found: version,
                expected: MDB_VERSION,
            });
        }
        if crc32fast::hash(&buf[..CRC_AT]) != read_u32(buf, CRC_AT) {
            return Err(Error::Corrupted("meta page checksum"));
        }
        let page_size = read_u32(buf, 8);
        if page_size as usize != PAGE_SIZE {
            return Err(Error::Invalid);
        }
        Ok(MetaHeader {
            magic,
            version,
            page_size,
            txnid: read_u64(buf, 16),
            last_pgno: read_u64(buf, 24),
            catalog: RunPtr::decode(&buf[32..])?,
            free: RunPtr::decode(&buf[52..])?,
        })
    }

    /// Check that everything the header points at lies inside the file
    pub(crate) fn validate(&self, file_len: u64) -> Result<()> {
        let file_pages = file_len / PAGE_SIZE as u64;
        if self.last_pgno < META_PAGES as u64 || self.last_pgno > file_pages {
            return Err(Error::Corrupted("meta points past end of file"));
        }
        for ptr in [&self.catalog, &self.free] {
            if !ptr.is_empty()
                && (ptr.pgno < META_PAGES as u64 || ptr.pgno + ptr.pages() > self.last_pgno)
            {
                return Err(Error::Corrupted("meta points past end of file"));
            }
        }
        Ok(())
    }
}

/// Pick the newest usable meta page.
///
/// The flag is set when the other slot was unreadable and had to be skipped.
pub(crate) fn select_meta(
    slots: [Result<MetaHeader>; 2],
    file_len: u64,
) -> Result<(MetaHeader, bool)> {
    let [first, second] = slots.map(|slot| slot.and_then(|m| m.validate(file_len).map(|_| m)));
    match (first, second) {
        (Ok(a), Ok(b)) => Ok(if a.txnid >= b.txnid { (a, false) } else { (b, false) }),
        (Ok(m), Err(e)) | (Err(e), Ok(m)) => {
            log::debug!("meta slot unreadable ({}), using txn {}", e, m.txnid);
            Ok((m, true))
        }
        (Err(e), Err(_)) => Err(e),
    }
}

/// Catalog record for one named database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DbRecord {
    pub(crate) kind: DbKind,
    /// Committed run
    pub(crate) root: RunPtr,
    /// Committed entries
    pub(crate) entries: u64,
}

impl DbRecord {
    pub(crate) const ENCODED_SIZE: usize = 1 + RunPtr::ENCODED_SIZE + 8;

    pub(crate) fn empty(kind: DbKind) -> Self {
        Self {
            kind,
            root: RunPtr::default(),
            entries: 0,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_SIZE);
        buf.push(self.kind.as_u8());
        self.root.encode_into(&mut buf);
        buf.extend_from_slice(&self.entries.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::ENCODED_SIZE {
            return Err(Error::Corrupted("catalog record size"));
        }
        let kind = DbKind::from_u8(buf[0]).ok_or(Error::Corrupted("catalog record kind"))?;
        Ok(Self {
            kind,
            root: RunPtr::decode(&buf[1..])?,
            entries: read_u64(buf, 1 + RunPtr::ENCODED_SIZE),
        })
    }
}
