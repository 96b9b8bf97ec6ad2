//! Free page extents.
//!
//! Kept sorted by page number and coalesced. Persisted as a run keyed by the
//! big-endian page number so the run order matches the extent order.

use crate::error::{Error, Result};
use crate::page::{run_size, Run, RunWriter};

/// A contiguous range of pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    pub pgno: u64,
    pub npages: u64,
}

impl Extent {
    pub fn new(pgno: u64, npages: u64) -> Self {
        Extent { pgno, npages }
    }

    pub fn end(&self) -> u64 {
        self.pgno + self.npages
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FreeList {
    extents: Vec<Extent>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of extents
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Total free pages
    pub fn pages(&self) -> u64 {
        self.extents.iter().map(|e| e.npages).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    /// First-fit allocation of `npages` contiguous pages
    pub fn alloc(&mut self, npages: u64) -> Option<u64> {
        debug_assert!(npages > 0);
        let pos = self.extents.iter().position(|e| e.npages >= npages)?;
        let extent = &mut self.extents[pos];
        let pgno = extent.pgno;
        if extent.npages == npages {
            self.extents.remove(pos);
        } else {
            extent.pgno += npages;
            extent.npages -= npages;
        }
        Some(pgno)
    }

    /// Return an extent to the list, merging it with its neighbours
    pub fn release(&mut self, extent: Extent) {
        if extent.npages == 0 {
            return;
        }
        let pos = self.extents.partition_point(|e| e.pgno < extent.pgno);
        debug_assert!(
            pos == self.extents.len() || extent.end() <= self.extents[pos].pgno,
            "extent {:?} overlaps a free extent",
            extent
        );
        self.extents.insert(pos, extent);

        if pos + 1 < self.extents.len() && self.extents[pos].end() == self.extents[pos + 1].pgno {
            self.extents[pos].npages += self.extents[pos + 1].npages;
            self.extents.remove(pos + 1);
        }
        if pos > 0 && self.extents[pos - 1].end() == self.extents[pos].pgno {
            self.extents[pos - 1].npages += self.extents[pos].npages;
            self.extents.remove(pos);
        }
    }

    /// Encoded size of a list holding `count` extents
    pub fn encoded_size(count: usize) -> usize {
        if count == 0 {
            0
        } else {
            run_size(count, count * 16)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = RunWriter::new();
        for extent in &self.extents {
            writer.push(&extent.pgno.to_be_bytes(), &extent.npages.to_le_bytes())?;
        }
        Ok(writer.finish())
    }

    pub fn decode(run: Run<'_>) -> Result<Self> {
        let mut list = FreeList::new();
        for index in 0..run.len() {
            let (key, value) = run.entry(index)?;
            let (Ok(pgno), Ok(npages)) = (<[u8; 8]>::try_from(key), <[u8; 8]>::try_from(value))
            else {
                return Err(Error::Corrupted("free list entry"));
            };
            let extent = Extent::new(u64::from_be_bytes(pgno), u64::from_le_bytes(npages));
            if extent.npages == 0 || list.extents.last().is_some_and(|last| last.end() > extent.pgno) {
                return Err(Error::Corrupted("free list order"));
            }
            list.extents.push(extent);
        }
        Ok(list)
    }
}

/// Hands out pages for one commit: free extents first, then the file tail.
#[derive(Debug)]
pub(crate) struct PageAllocator {
    free: FreeList,
    next: u64,
}

impl PageAllocator {
    pub fn new(free: FreeList, last_pgno: u64) -> Self {
        PageAllocator {
            free,
            next: last_pgno,
        }
    }

    pub fn alloc(&mut self, npages: u64) -> u64 {
        if let Some(pgno) = self.free.alloc(npages) {
            return pgno;
        }
        let pgno = self.next;
        self.next += npages;
        pgno
    }

    /// Allocate past the end of the file, leaving free extents alone
    pub fn alloc_tail(&mut self, npages: u64) -> u64 {
        let pgno = self.next;
        self.next += npages;
        pgno
    }

    /// Extents still unused
    pub fn remaining(&self) -> &FreeList {
        &self.free
    }

    /// Leftover free list and the new first never-used page
    pub fn finish(self) -> (FreeList, u64) {
        (self.free, self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(extents: &[(u64, u64)]) -> FreeList {
        let mut list = FreeList::new();
        for &(pgno, npages) in extents {
            list.release(Extent::new(pgno, npages));
        }
        list
    }

    #[test]
    fn test_release_coalesces() {
        let list = list(&[(10, 2), (2, 3), (5, 5), (20, 1)]);
        let extents: Vec<_> = list.iter().copied().collect();
        assert_eq!(extents, vec![Extent::new(2, 10), Extent::new(20, 1)]);
        assert_eq!(list.pages(), 11);
    }

    #[test]
    fn test_alloc_first_fit() {
        let mut list = list(&[(2, 1), (6, 4)]);
        assert_eq!(list.alloc(2), Some(6));
        assert_eq!(list.alloc(1), Some(2));
        assert_eq!(list.alloc(3), None);
        assert_eq!(list.alloc(2), Some(8));
        assert!(list.is_empty());
    }

    #[test]
    fn test_allocator_falls_back_to_tail() {
        let mut alloc = PageAllocator::new(list(&[(3, 1)]), 10);
        assert_eq!(alloc.alloc(2), 10);
        assert_eq!(alloc.alloc(1), 3);
        assert_eq!(alloc.alloc(1), 12);
        let (free, next) = alloc.finish();
        assert!(free.is_empty());
        assert_eq!(next, 13);
    }

    #[test]
    fn test_encode_decode() {
        let list = list(&[(300, 2), (2, 1), (70_000, 9)]);
        let bytes = list.encode().unwrap();
        assert_eq!(bytes.len(), FreeList::encoded_size(3));
        let decoded = FreeList::decode(Run::new(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(FreeList::encoded_size(0), 0);
    }
}
