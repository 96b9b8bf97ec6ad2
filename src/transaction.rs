use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::OnceCell;

use crate::constants::{EnvFlags, PAGE_SIZE};
use crate::env::EnvInner;
use crate::error::{Error, Result};
use crate::file::RunSource;
use crate::freelist::{Extent, FreeList, PageAllocator};
use crate::meta::{DbRecord, MetaHeader};
use crate::page::{pages_for, Run, RunPtr, RunWriter};

/// Pending changes to one database
#[derive(Debug, Default)]
pub(crate) struct Overlay {
    /// Hide the committed run entirely
    pub(crate) cleared: bool,
    /// Pending writes, `None` marks a deletion
    pub(crate) entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

/// The implicit write transaction: everything changed since the last commit.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    /// Overlays by dbi
    overlays: HashMap<u32, Overlay>,
    /// Databases created since the last commit
    created: BTreeSet<u32>,
}

impl Transaction {
    pub(crate) fn is_dirty(&self) -> bool {
        !self.overlays.is_empty() || !self.created.is_empty()
    }

    pub(crate) fn overlay(&self, dbi: u32) -> Option<&Overlay> {
        self.overlays.get(&dbi)
    }

    pub(crate) fn overlay_mut(&mut self, dbi: u32) -> &mut Overlay {
        self.overlays.entry(dbi).or_default()
    }

    pub(crate) fn mark_created(&mut self, dbi: u32) {
        self.created.insert(dbi);
    }

    pub(crate) fn is_created(&self, dbi: u32) -> bool {
        self.created.contains(&dbi)
    }

    /// Databases whose run must be rewritten, in dbi order
    fn dirty_dbis(&self) -> BTreeSet<u32> {
        self.overlays
            .keys()
            .copied()
            .chain(self.created.iter().copied())
            .collect()
    }

    /// Drop pending writes. Created databases stay registered.
    pub(crate) fn discard(&mut self) {
        self.overlays.clear();
    }

    fn finish(&mut self) {
        self.overlays.clear();
        self.created.clear();
    }
}

fn place(alloc: &mut PageAllocator, writes: &mut Vec<(u64, Vec<u8>)>, bytes: Vec<u8>) -> RunPtr {
    if bytes.is_empty() {
        return RunPtr::default();
    }
    let ptr = RunPtr {
        pgno: alloc.alloc(pages_for(bytes.len())),
        len: bytes.len() as u64,
        crc: crc32fast::hash(&bytes),
    };
    writes.push((ptr.pgno, bytes));
    ptr
}

fn release(freed: &mut FreeList, ptr: &RunPtr) {
    if !ptr.is_empty() {
        freed.release(Extent::new(ptr.pgno, ptr.pages()));
    }
}

impl EnvInner {
    /// Merge the committed run of `dbi` with its overlay into a new run
    fn merged_run(&self, dbi: u32) -> Result<(Vec<u8>, u64)> {
        let overlay = self.txn.overlay(dbi);
        let run = match overlay {
            Some(overlay) if overlay.cleared => Run::EMPTY,
            _ => self.committed_run(dbi)?,
        };
        let mut pending = overlay
            .into_iter()
            .flat_map(|overlay| overlay.entries.iter())
            .peekable();
        let mut writer = RunWriter::new();

        for index in 0..run.len() {
            let (key, value) = run.entry(index)?;
            while let Some((pkey, pvalue)) = pending.next_if(|&(pkey, _)| pkey.as_slice() < key) {
                if let Some(pvalue) = pvalue {
                    writer.push(pkey, pvalue)?;
                }
            }
            match pending.next_if(|&(pkey, _)| pkey.as_slice() == key) {
                Some((_, Some(pvalue))) => writer.push(key, pvalue)?,
                Some((_, None)) => {}
                None => writer.push(key, value)?,
            }
        }
        for (pkey, pvalue) in pending {
            if let Some(pvalue) = pvalue {
                writer.push(pkey, pvalue)?;
            }
        }

        let entries = writer.len() as u64;
        Ok((writer.finish(), entries))
    }

    fn write_meta(&self, meta: &MetaHeader, sync: bool) -> Result<()> {
        self.file.write_meta(meta)?;
        if sync {
            self.file.sync()?;
        }
        Ok(())
    }

    /// Write every pending change as one atomic, durable transaction.
    ///
    /// New runs only ever land on pages that the last durable meta does not
    /// reference, so a crash at any point leaves that meta intact. Returns
    /// the new txn id, or `None` when nothing was pending. A failure before
    /// the meta write keeps the pending changes for a retry. A failed meta
    /// update fails this and every later commit with [`Error::Panic`].
    pub(crate) fn commit(&mut self, flags: EnvFlags) -> Result<Option<u64>> {
        if flags.contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        if self.fatal {
            return Err(Error::Panic);
        }
        if !self.txn.is_dirty() {
            return Ok(None);
        }
        let sync = !flags.contains(EnvFlags::NOSYNC);
        let txnid = self.meta.txnid + 1;

        let mut alloc = PageAllocator::new(self.free.clone(), self.meta.last_pgno);
        let mut freed = FreeList::new();
        let mut writes: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut records: Vec<(u32, DbRecord)> = Vec::new();

        for dbi in self.txn.dirty_dbis() {
            let state = &self.dbs[dbi as usize];
            let (bytes, entries) = self.merged_run(dbi)?;
            debug_assert_eq!(entries, state.entries, "live count drifted for {:?}", state.name);
            let root = place(&mut alloc, &mut writes, bytes);
            release(&mut freed, &state.record.root);
            records.push((
                dbi,
                DbRecord {
                    kind: state.record.kind,
                    root,
                    entries,
                },
            ));
        }

        let updated: HashMap<u32, DbRecord> = records.iter().copied().collect();
        let mut catalog: Vec<(&str, DbRecord)> = self
            .dbs
            .iter()
            .enumerate()
            .map(|(dbi, state)| {
                let record = updated.get(&(dbi as u32)).copied().unwrap_or(state.record);
                (state.name.as_str(), record)
            })
            .collect();
        catalog.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let mut writer = RunWriter::new();
        for (name, record) in &catalog {
            writer.push(name.as_bytes(), &record.encode())?;
        }
        let catalog_ptr = place(&mut alloc, &mut writes, writer.finish());
        release(&mut freed, &self.meta.catalog);
        release(&mut freed, &self.meta.free);

        // Reserve room for the free list before it is final. Allocation only
        // ever shrinks the extent count, so this bound holds.
        let bound = alloc.remaining().len() + freed.len();
        let reserve = pages_for(FreeList::encoded_size(bound));
        let free_pgno = match reserve {
            0 => None,
            n if freed.is_empty() => Some(alloc.alloc_tail(n)),
            n => Some(alloc.alloc(n)),
        };
        let (mut free, last_pgno) = alloc.finish();
        for extent in freed.iter() {
            free.release(*extent);
        }
        let free_bytes = free.encode()?;
        debug_assert!(free_bytes.len() as u64 <= reserve * PAGE_SIZE as u64);
        let free_ptr = match free_pgno {
            Some(pgno) if !free_bytes.is_empty() => {
                let ptr = RunPtr {
                    pgno,
                    len: free_bytes.len() as u64,
                    crc: crc32fast::hash(&free_bytes),
                };
                writes.push((pgno, free_bytes));
                ptr
            }
            _ => RunPtr::default(),
        };

        let meta = MetaHeader {
            txnid,
            last_pgno,
            catalog: catalog_ptr,
            free: free_ptr,
            ..MetaHeader::default()
        };

        let pages_written: u64 = writes.iter().map(|(_, bytes)| pages_for(bytes.len())).sum();
        self.file.ensure_len(last_pgno * PAGE_SIZE as u64)?;
        for (pgno, bytes) in &writes {
            self.file.write_at(pgno * PAGE_SIZE as u64, bytes)?;
        }
        if sync {
            self.file.sync()?;
        }
        // The new meta may reach the disk even when this fails. Its pages
        // must not be handed out again, so the environment stops committing.
        if let Err(e) = self.write_meta(&meta, sync) {
            self.fatal = true;
            log::error!("meta update for txn {} failed, refusing further commits: {}", txnid, e);
            return Err(e);
        }

        // Durable from here on; install the new state.
        self.meta = meta;
        self.free = free;
        for (dbi, record) in &records {
            let state = &mut self.dbs[*dbi as usize];
            state.record = *record;
            state.entries = record.entries;
            state.source = OnceCell::new();
        }
        self.txn.finish();
        if let Err(e) = self.file.remap() {
            // Mapped sources are stale without a map; reload them with reads.
            log::warn!("remap after txn {} failed, reading without a map: {}", txnid, e);
            for state in &mut self.dbs {
                state.source = OnceCell::new();
            }
        } else if self.file.is_mapped() {
            for (dbi, record) in &records {
                if !record.root.is_empty() {
                    self.dbs[*dbi as usize].source = OnceCell::with_value(RunSource::Mapped {
                        offset: record.root.offset(),
                        len: record.root.len as usize,
                    });
                }
            }
        }

        log::debug!(
            "committed txn {} ({} databases, {} pages written, last page {})",
            txnid,
            records.len(),
            pages_written,
            last_pgno
        );
        Ok(Some(txnid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::mmap_supported;
    use crate::database::Database;
    use crate::env::Environment;
    use crate::file::Fault;
    use crate::types::DbKind;
    use tempfile::TempDir;

    fn set_fault(env: &Environment, fault: Option<Fault>) {
        env.inner.write().file.fault = fault;
    }

    fn setup() -> (TempDir, Environment, Database) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path().join("data")).unwrap();
        let db = Database::open(&env, "db", DbKind::StringMap).unwrap();
        db.put(&env, b"a", b"1").unwrap();
        assert_eq!(env.commit().unwrap(), Some(1));
        (dir, env, db)
    }

    #[test]
    fn test_failed_write_keeps_pending_changes() {
        let (dir, env, db) = setup();
        db.put(&env, b"a", b"2").unwrap();
        db.put(&env, b"b", b"3").unwrap();

        set_fault(&env, Some(Fault::DataWrite));
        assert!(matches!(env.commit(), Err(Error::Io(_))));
        assert!(env.is_dirty());
        assert_eq!(env.stat().txn_id, 1);
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.len(&env).unwrap(), 2);

        set_fault(&env, None);
        assert_eq!(env.commit().unwrap(), Some(2));
        assert!(!env.is_dirty());
        env.close();

        let env = Environment::open(dir.path().join("data")).unwrap();
        let db = Database::open(&env, "db", DbKind::StringMap).unwrap();
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(&env, b"b").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_failed_write_leaves_last_commit_on_disk() {
        let (dir, env, db) = setup();
        db.put(&env, b"a", b"2").unwrap();
        set_fault(&env, Some(Fault::DataWrite));
        assert!(env.commit().is_err());
        env.close();

        let env = Environment::open(dir.path().join("data")).unwrap();
        assert_eq!(env.stat().txn_id, 1);
        let db = Database::open(&env, "db", DbKind::StringMap).unwrap();
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_failed_meta_update_refuses_commits() {
        let (dir, env, db) = setup();
        db.put(&env, b"a", b"2").unwrap();

        set_fault(&env, Some(Fault::MetaWrite));
        assert!(matches!(env.commit(), Err(Error::Io(_))));
        set_fault(&env, None);
        assert!(matches!(env.commit(), Err(Error::Panic)));
        db.put(&env, b"c", b"4").unwrap();
        assert!(matches!(env.commit(), Err(Error::Panic)));
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"2".to_vec()));
        env.close();

        // The meta landed before the error, and its runs were never reused.
        let env = Environment::open(dir.path().join("data")).unwrap();
        assert_eq!(env.stat().txn_id, 2);
        let db = Database::open(&env, "db", DbKind::StringMap).unwrap();
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.get(&env, b"c").unwrap(), None);
        db.put(&env, b"c", b"4").unwrap();
        assert_eq!(env.commit().unwrap(), Some(3));
    }

    #[test]
    fn test_failed_remap_falls_back_to_reads() {
        let (_dir, env, db) = setup();
        let other = Database::open(&env, "other", DbKind::StringMap).unwrap();
        other.put(&env, b"x", b"y").unwrap();
        assert_eq!(env.commit().unwrap(), Some(2));
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"1".to_vec()));

        set_fault(&env, Some(Fault::Remap));
        other.put(&env, b"z", b"w").unwrap();
        assert_eq!(env.commit().unwrap(), Some(3));
        assert!(!env.info().mapped);
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(other.get(&env, b"z").unwrap(), Some(b"w".to_vec()));

        set_fault(&env, None);
        other.del(&env, b"x").unwrap();
        assert_eq!(env.commit().unwrap(), Some(4));
        assert_eq!(env.info().mapped, mmap_supported());
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(other.len(&env).unwrap(), 1);
    }
}
