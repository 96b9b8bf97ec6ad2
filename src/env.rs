use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::constants::{
    mmap_supported, EnvFlags, DEFAULT_MAP_GROWTH, MAX_MAP_GROWTH, META_PAGES, PAGE_SIZE,
    VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::database::DbState;
use crate::error::{Error, Result};
use crate::file::{self, DataFile};
use crate::freelist::FreeList;
use crate::meta::{select_meta, DbRecord, MetaHeader};
use crate::page::{pages_for, Run, RunPtr, RunWriter};
use crate::transaction::{Overlay, Transaction};
use crate::types::{EnvInfo, Stat};

lazy_static! {
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC;
    /// Canonical paths of the environments open in this process
    static ref OPEN_PATHS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

/// Claim on a data file path, released on drop
#[derive(Debug)]
struct Registration(PathBuf);

impl Registration {
    fn acquire(path: PathBuf) -> Result<Self> {
        if !OPEN_PATHS.lock().insert(path.clone()) {
            return Err(Error::EnvAlreadyOpen(path));
        }
        Ok(Registration(path))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        OPEN_PATHS.lock().remove(&self.0);
    }
}

/// Options for opening an [`Environment`]
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    flags: EnvFlags,
    map_growth: usize,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        let flags = if mmap_supported() {
            EnvFlags::empty()
        } else {
            EnvFlags::NOMMAP
        };
        EnvBuilder {
            flags,
            map_growth: DEFAULT_MAP_GROWTH,
        }
    }
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the open flags. `NOMMAP` is forced where maps are unsupported.
    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        if !mmap_supported() {
            self.flags |= EnvFlags::NOMMAP;
        }
        self
    }

    /// Step, in bytes, by which the data file grows. At most 1 GiB.
    pub fn map_growth(mut self, bytes: usize) -> Self {
        self.map_growth = bytes;
        self
    }

    /// Open or create the data file at `path`
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Environment> {
        let path = path.as_ref();
        let flags = self.flags;
        if self.map_growth > MAX_MAP_GROWTH {
            return Err(Error::EnvInvalidConfig("map growth step above 1 GiB"));
        }
        let mut file = DataFile::open(path, flags, self.map_growth)?;
        let registration = Registration::acquire(fs::canonicalize(path)?)?;

        if file.len() == 0 {
            if flags.contains(EnvFlags::RDONLY) {
                return Err(Error::Invalid);
            }
            file.init(&MetaHeader::default(), !flags.contains(EnvFlags::NOSYNC))?;
            log::info!("initialized new cache file {}", path.display());
        }
        if file.len() < (META_PAGES * PAGE_SIZE) as u64 {
            return Err(Error::Invalid);
        }

        let slots = [file.read_meta(0), file.read_meta(1)];
        let (meta, fallback) = select_meta(slots, file.len())?;
        if fallback {
            log::warn!(
                "{}: skipped an unreadable meta page, recovered txn {}",
                path.display(),
                meta.txnid
            );
        }
        file.remap()?;

        let free = load_free_list(&file, &meta)?;
        let (dbs, names) = load_catalog(&file, &meta)?;
        log::info!(
            "opened {} at txn {} ({} databases, mmap: {})",
            path.display(),
            meta.txnid,
            dbs.len(),
            file.is_mapped()
        );

        Ok(Environment {
            id: NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            flags: AtomicU32::new(flags.bits()),
            inner: RwLock::new(EnvInner {
                file,
                meta,
                free,
                dbs,
                names,
                txn: Transaction::default(),
                fatal: false,
            }),
            _registration: registration,
        })
    }
}

fn load_free_list(file: &DataFile, meta: &MetaHeader) -> Result<FreeList> {
    let source = file.resolve(&meta.free)?;
    let list = FreeList::decode(Run::new(file.bytes(&source)?)?)?;
    if list
        .iter()
        .any(|extent| extent.pgno < META_PAGES as u64 || extent.end() > meta.last_pgno)
    {
        return Err(Error::Corrupted("free extent past end of file"));
    }
    Ok(list)
}

fn load_catalog(file: &DataFile, meta: &MetaHeader) -> Result<(Vec<DbState>, HashMap<String, u32>)> {
    let source = file.resolve(&meta.catalog)?;
    let run = Run::new(file.bytes(&source)?)?;
    let mut dbs = Vec::with_capacity(run.len());
    let mut names = HashMap::with_capacity(run.len());
    for index in 0..run.len() {
        let (key, value) = run.entry(index)?;
        let name = std::str::from_utf8(key).map_err(|_| Error::Corrupted("catalog name"))?;
        let record = DbRecord::decode(value)?;
        let root = &record.root;
        if !root.is_empty()
            && (root.pgno < META_PAGES as u64 || root.pgno + root.pages() > meta.last_pgno)
        {
            return Err(Error::Corrupted("database run past end of file"));
        }
        names.insert(name.to_owned(), dbs.len() as u32);
        dbs.push(DbState::new(name.to_owned(), record));
    }
    Ok((dbs, names))
}

/// A single-file, single-writer store of named sorted databases.
///
/// All changes made through the environment form one implicit write
/// transaction that becomes durable on [`Environment::commit`].
#[derive(Debug)]
pub struct Environment {
    pub(crate) id: u64,
    path: PathBuf,
    flags: AtomicU32,
    pub(crate) inner: RwLock<EnvInner>,
    _registration: Registration,
}

/// State guarded by the environment lock
#[derive(Debug)]
pub(crate) struct EnvInner {
    pub(crate) file: DataFile,
    /// Last durable meta
    pub(crate) meta: MetaHeader,
    /// Extents the next commit may reuse
    pub(crate) free: FreeList,
    /// Open databases, indexed by dbi
    pub(crate) dbs: Vec<DbState>,
    pub(crate) names: HashMap<String, u32>,
    pub(crate) txn: Transaction,
    /// A meta update failed; commits are refused until reopen
    pub(crate) fatal: bool,
}

impl Environment {
    /// Open with default options
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        EnvBuilder::default().open(path)
    }

    pub fn builder() -> EnvBuilder {
        EnvBuilder::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Toggle flags that may change after open
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if flags.is_empty() || !CHANGEABLE.contains(flags) {
            return Err(Error::EnvFlagsImmutable);
        }
        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn is_readonly(&self) -> bool {
        self.flags().contains(EnvFlags::RDONLY)
    }

    /// Make every pending change durable.
    ///
    /// Returns the id of the new transaction, or `None` if nothing changed.
    pub fn commit(&self) -> Result<Option<u64>> {
        let flags = self.flags();
        self.inner.write().commit(flags)
    }

    /// Discard every pending change
    pub fn rollback(&self) {
        self.inner.write().rollback();
    }

    /// Whether there are uncommitted changes
    pub fn is_dirty(&self) -> bool {
        self.inner.read().txn.is_dirty()
    }

    /// Flush the data file. Without `force` this is skipped under `NOSYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::EnvReadOnly);
        }
        if force || !self.flags().contains(EnvFlags::NOSYNC) {
            self.inner.read().file.sync()?;
        }
        Ok(())
    }

    pub fn stat(&self) -> Stat {
        let inner = self.inner.read();
        Stat {
            psize: PAGE_SIZE as u32,
            txn_id: inner.meta.txnid,
            last_pgno: inner.meta.last_pgno,
            free_pages: inner.free.pages(),
            databases: inner.dbs.len(),
        }
    }

    pub fn info(&self) -> EnvInfo {
        let inner = self.inner.read();
        EnvInfo {
            path: self.path.clone(),
            mapsize: inner.file.map_len(),
            mapped: inner.file.is_mapped(),
            last_pgno: inner.meta.last_pgno,
            last_txnid: inner.meta.txnid,
            dirty: inner.txn.is_dirty(),
        }
    }

    /// Names of every open database, sorted
    pub fn db_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().names.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write a compacted copy of the last committed state to a new file.
    ///
    /// The copy has no free pages. Pending changes are not included.
    pub fn copy_compact<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let inner = self.inner.read();
        let dst = OpenOptions::new().write(true).create_new(true).open(path)?;

        let mut names: Vec<(&String, u32)> = inner
            .names
            .iter()
            .map(|(name, &dbi)| (name, dbi))
            .filter(|&(_, dbi)| !inner.txn.is_created(dbi))
            .collect();
        names.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let mut next = META_PAGES as u64;
        let mut catalog = RunWriter::new();
        for &(name, dbi) in &names {
            let bytes = inner.committed_bytes(dbi)?;
            let mut record = inner.dbs[dbi as usize].record;
            if !bytes.is_empty() {
                record.root.pgno = next;
                file::write_all_at(&dst, bytes, next * PAGE_SIZE as u64)?;
                next += record.root.pages();
            }
            catalog.push(name.as_bytes(), &record.encode())?;
        }

        let catalog = catalog.finish();
        let mut meta = MetaHeader {
            txnid: inner.meta.txnid,
            ..MetaHeader::default()
        };
        if !catalog.is_empty() {
            meta.catalog = RunPtr {
                pgno: next,
                len: catalog.len() as u64,
                crc: crc32fast::hash(&catalog),
            };
            file::write_all_at(&dst, &catalog, next * PAGE_SIZE as u64)?;
            next += pages_for(catalog.len());
        }
        meta.last_pgno = next;
        dst.set_len(next * PAGE_SIZE as u64)?;
        let buf = meta.encode();
        for slot in 0..META_PAGES {
            file::write_all_at(&dst, &buf, (slot * PAGE_SIZE) as u64)?;
        }
        dst.sync_all()?;

        log::info!(
            "copied {} databases at txn {} to {} ({} pages)",
            names.len(),
            meta.txnid,
            path.display(),
            next
        );
        Ok(())
    }

    /// Close the environment, discarding uncommitted changes
    pub fn close(self) {
        drop(self);
    }

    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    pub fn version_string() -> String {
        format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.inner.get_mut().txn.is_dirty() {
            log::warn!(
                "{}: closing with uncommitted changes, discarding them",
                self.path.display()
            );
        }
        log::info!("closed {}", self.path.display());
    }
}

fn check_size(buf: &[u8]) -> Result<()> {
    u32::try_from(buf.len()).map_err(|_| Error::BadValSize(buf.len()))?;
    Ok(())
}

impl EnvInner {
    /// Bytes of the committed run of `dbi`, verified on first access
    pub(crate) fn committed_bytes(&self, dbi: u32) -> Result<&[u8]> {
        let state = &self.dbs[dbi as usize];
        let source = state
            .source
            .get_or_try_init(|| self.file.resolve(&state.record.root))?;
        self.file.bytes(source)
    }

    pub(crate) fn committed_run(&self, dbi: u32) -> Result<Run<'_>> {
        Run::new(self.committed_bytes(dbi)?)
    }

    /// Committed run as seen through a pending clear
    fn visible_run(&self, dbi: u32) -> Result<Run<'_>> {
        match self.txn.overlay(dbi) {
            Some(overlay) if overlay.cleared => Ok(Run::EMPTY),
            _ => self.committed_run(dbi),
        }
    }

    pub(crate) fn lookup(&self, dbi: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.txn.overlay(dbi).and_then(|o| o.entries.get(key)) {
            return Ok(pending.clone());
        }
        Ok(self.visible_run(dbi)?.get(key)?.map(<[u8]>::to_vec))
    }

    /// Store `value` under `key`, returning the value it replaced
    pub(crate) fn put(&mut self, dbi: u32, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        check_size(key)?;
        check_size(value)?;
        let prev = self.lookup(dbi, key)?;
        self.txn
            .overlay_mut(dbi)
            .entries
            .insert(key.to_vec(), Some(value.to_vec()));
        if prev.is_none() {
            self.dbs[dbi as usize].entries += 1;
        }
        Ok(prev)
    }

    pub(crate) fn del(&mut self, dbi: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let prev = self.lookup(dbi, key)?;
        if prev.is_some() {
            self.txn.overlay_mut(dbi).entries.insert(key.to_vec(), None);
            self.dbs[dbi as usize].entries -= 1;
        }
        Ok(prev)
    }

    pub(crate) fn clear(&mut self, dbi: u32) {
        *self.txn.overlay_mut(dbi) = Overlay {
            cleared: true,
            entries: BTreeMap::new(),
        };
        self.dbs[dbi as usize].entries = 0;
    }

    /// First visible entry whose key satisfies `from`
    pub(crate) fn seek(&self, dbi: u32, from: Bound<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let overlay = self.txn.overlay(dbi);
        let run = self.visible_run(dbi)?;
        let mut index = match from {
            Bound::Unbounded => 0,
            Bound::Included(key) => run.lower_bound(key)?,
            Bound::Excluded(key) => run.upper_bound(key)?,
        };

        // Keys with a pending write are answered by the overlay.
        let mut committed = None;
        while index < run.len() {
            let (key, value) = run.entry(index)?;
            if overlay.map_or(true, |o| !o.entries.contains_key(key)) {
                committed = Some((key, value));
                break;
            }
            index += 1;
        }

        let pending = overlay.and_then(|o| {
            o.entries
                .range::<[u8], _>((from, Bound::Unbounded))
                .find_map(|(key, value)| value.as_deref().map(|value| (key.as_slice(), value)))
        });

        let next = match (committed, pending) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        Ok(next.map(|(key, value)| (key.to_vec(), value.to_vec())))
    }

    pub(crate) fn rollback(&mut self) {
        let dirty = self.txn.is_dirty();
        self.txn.discard();
        for state in &mut self.dbs {
            state.entries = state.record.entries;
        }
        if dirty {
            log::debug!("rolled back to txn {}", self.meta.txnid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_flags_only_nosync() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path().join("data")).unwrap();
        env.set_flags(EnvFlags::NOSYNC, true).unwrap();
        assert!(env.flags().contains(EnvFlags::NOSYNC));
        env.set_flags(EnvFlags::NOSYNC, false).unwrap();
        assert!(!env.flags().contains(EnvFlags::NOSYNC));
        assert!(matches!(
            env.set_flags(EnvFlags::RDONLY, true),
            Err(Error::EnvFlagsImmutable)
        ));
    }

    #[test]
    fn test_same_path_twice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let env = Environment::open(&path).unwrap();
        assert!(matches!(
            Environment::open(&path),
            Err(Error::EnvAlreadyOpen(_))
        ));
        env.close();
        Environment::open(&path).unwrap();
    }

    #[test]
    fn test_garbage_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, vec![0x5a; 3 * PAGE_SIZE]).unwrap();
        assert!(matches!(Environment::open(&path), Err(Error::Invalid)));

        // A failed open releases the path.
        fs::write(&path, b"short").unwrap();
        assert!(matches!(Environment::open(&path), Err(Error::Invalid)));
    }

    #[test]
    fn test_rejects_huge_growth_step() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let res = Environment::builder()
            .map_growth(MAX_MAP_GROWTH + 1)
            .open(&path);
        assert!(matches!(res, Err(Error::EnvInvalidConfig(_))));
        assert!(!path.exists());

        let env = Environment::builder().map_growth(2 * PAGE_SIZE).open(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * PAGE_SIZE as u64);
        env.close();
    }

    #[test]
    fn test_version_string() {
        let (major, minor, patch) = Environment::version();
        assert_eq!(
            Environment::version_string(),
            format!("{}.{}.{}", major, minor, patch)
        );
    }
}
