use once_cell::sync::OnceCell;
use parking_lot::RwLockUpgradableReadGuard;

use crate::cursor::Cursor;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::file::RunSource;
use crate::meta::DbRecord;
use crate::types::{DbKind, DbStat};

/// Per-database state held by the environment
#[derive(Debug)]
pub(crate) struct DbState {
    pub(crate) name: String,
    /// Last committed record
    pub(crate) record: DbRecord,
    /// Committed run bytes, resolved on first access
    pub(crate) source: OnceCell<RunSource>,
    /// Live entries, pending changes included
    pub(crate) entries: u64,
}

impl DbState {
    pub(crate) fn new(name: String, record: DbRecord) -> Self {
        DbState {
            name,
            entries: record.entries,
            record,
            source: OnceCell::new(),
        }
    }
}

/// Database handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    /// Environment the handle was opened in
    env_id: u64,
    /// Database identifier
    dbi: u32,
    kind: DbKind,
    name: String,
}

impl Database {
    /// Open a named database, creating it when absent.
    ///
    /// A database keeps the kind it was created with; opening it as another
    /// kind fails with [`Error::Incompatible`].
    pub fn open(env: &Environment, name: &str, kind: DbKind) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::BadName(name.to_owned()));
        }
        let inner = env.inner.upgradable_read();
        if let Some(&dbi) = inner.names.get(name) {
            let found = inner.dbs[dbi as usize].record.kind;
            if found != kind {
                return Err(Error::Incompatible {
                    name: name.to_owned(),
                    expected: kind,
                    found,
                });
            }
            return Ok(Database {
                env_id: env.id,
                dbi,
                kind,
                name: name.to_owned(),
            });
        }
        if env.is_readonly() {
            return Err(Error::EnvReadOnly);
        }

        let mut inner = RwLockUpgradableReadGuard::upgrade(inner);
        let dbi = inner.dbs.len() as u32;
        inner
            .dbs
            .push(DbState::new(name.to_owned(), DbRecord::empty(kind)));
        inner.names.insert(name.to_owned(), dbi);
        inner.txn.mark_created(dbi);
        log::debug!("created {} {:?}", kind, name);

        Ok(Database {
            env_id: env.id,
            dbi,
            kind,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    fn dbi(&self, env: &Environment) -> Result<u32> {
        if self.env_id != env.id {
            return Err(Error::BadDbi);
        }
        Ok(self.dbi)
    }

    fn writable_dbi(&self, env: &Environment) -> Result<u32> {
        let dbi = self.dbi(env)?;
        if env.is_readonly() {
            return Err(Error::EnvReadOnly);
        }
        Ok(dbi)
    }

    /// Get the value stored under `key`
    pub fn get(&self, env: &Environment, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let dbi = self.dbi(env)?;
        env.inner.read().lookup(dbi, key)
    }

    pub fn contains(&self, env: &Environment, key: &[u8]) -> Result<bool> {
        Ok(self.get(env, key)?.is_some())
    }

    /// Store a key/value pair, returning the value it replaced
    pub fn put(&self, env: &Environment, key: &[u8], data: &[u8]) -> Result<Option<Vec<u8>>> {
        let dbi = self.writable_dbi(env)?;
        env.inner.write().put(dbi, key, data)
    }

    /// Delete `key`, returning its value if it was present
    pub fn del(&self, env: &Environment, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let dbi = self.writable_dbi(env)?;
        env.inner.write().del(dbi, key)
    }

    /// Remove every entry
    pub fn clear(&self, env: &Environment) -> Result<()> {
        let dbi = self.writable_dbi(env)?;
        env.inner.write().clear(dbi);
        Ok(())
    }

    pub fn len(&self, env: &Environment) -> Result<u64> {
        let dbi = self.dbi(env)?;
        Ok(env.inner.read().dbs[dbi as usize].entries)
    }

    pub fn is_empty(&self, env: &Environment) -> Result<bool> {
        Ok(self.len(env)? == 0)
    }

    pub fn stat(&self, env: &Environment) -> Result<DbStat> {
        let dbi = self.dbi(env)?;
        let inner = env.inner.read();
        let state = &inner.dbs[dbi as usize];
        Ok(DbStat {
            kind: state.record.kind,
            entries: state.entries,
            pages: state.record.root.pages(),
            bytes: state.record.root.len,
        })
    }

    /// Cursor over the entries in key order
    pub fn cursor<'env>(&self, env: &'env Environment) -> Result<Cursor<'env>> {
        self.dbi(env)?;
        Ok(Cursor::new(env, self.clone()))
    }

    pub(crate) fn raw_dbi(&self) -> u32 {
        self.dbi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Environment) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path().join("data")).unwrap();
        (dir, env)
    }

    #[test]
    fn test_put_get_del() {
        let (_dir, env) = setup();
        let db = Database::open(&env, "counts", DbKind::LongMap).unwrap();
        assert_eq!(db.put(&env, b"a", b"1").unwrap(), None);
        assert_eq!(db.put(&env, b"a", b"2").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(&env, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.len(&env).unwrap(), 1);
        assert_eq!(db.del(&env, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.del(&env, b"a").unwrap(), None);
        assert!(db.is_empty(&env).unwrap());
    }

    #[test]
    fn test_open_checks_name_and_kind() {
        let (_dir, env) = setup();
        assert!(matches!(
            Database::open(&env, "", DbKind::StringSet),
            Err(Error::BadName(_))
        ));
        let db = Database::open(&env, "users", DbKind::StringSet).unwrap();
        assert_eq!(Database::open(&env, "users", DbKind::StringSet).unwrap(), db);
        assert!(matches!(
            Database::open(&env, "users", DbKind::LongMap),
            Err(Error::Incompatible {
                expected: DbKind::LongMap,
                found: DbKind::StringSet,
                ..
            })
        ));
    }

    #[test]
    fn test_handle_from_other_env() {
        let (_dir, env) = setup();
        let (_other_dir, other) = setup();
        let db = Database::open(&env, "m", DbKind::StringMap).unwrap();
        assert!(matches!(db.get(&other, b"k"), Err(Error::BadDbi)));
        assert!(matches!(db.put(&other, b"k", b"v"), Err(Error::BadDbi)));
    }

    #[test]
    fn test_clear_hides_committed() {
        let (_dir, env) = setup();
        let db = Database::open(&env, "m", DbKind::StringMap).unwrap();
        db.put(&env, b"x", b"1").unwrap();
        db.put(&env, b"y", b"2").unwrap();
        env.commit().unwrap();

        db.clear(&env).unwrap();
        assert_eq!(db.get(&env, b"x").unwrap(), None);
        db.put(&env, b"z", b"3").unwrap();
        assert_eq!(db.len(&env).unwrap(), 1);
        env.commit().unwrap();

        assert_eq!(db.get(&env, b"y").unwrap(), None);
        assert_eq!(db.get(&env, b"z").unwrap(), Some(b"3".to_vec()));
        let stat = db.stat(&env).unwrap();
        assert_eq!(stat.entries, 1);
        assert_eq!(stat.pages, 1);
    }
}
