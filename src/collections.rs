//! Typed containers over named databases.
//!
//! Handles borrow the environment, so they cannot outlive the manager that
//! opened them. Two handles for the same name share the same data.

use std::marker::PhantomData;

use crate::codec::{decode_str, Codec, I64Codec, NestedMapCodec, StrCodec, UnitCodec};
use crate::cursor::Cursor;
use crate::database::Database;
use crate::env::Environment;
use crate::error::Result;

/// Map from string keys to values encoded by `C`
#[derive(Debug)]
pub struct CachedMap<'m, C> {
    env: &'m Environment,
    db: Database,
    _codec: PhantomData<C>,
}

/// String -> i64
pub type LongMap<'m> = CachedMap<'m, I64Codec>;
/// String -> String
pub type StringMap<'m> = CachedMap<'m, StrCodec>;
/// String -> (String -> i64)
pub type MapToMap<'m> = CachedMap<'m, NestedMapCodec>;

impl<'m, C: Codec> CachedMap<'m, C> {
    /// Create-or-open the map called `name`
    pub fn open(env: &'m Environment, name: &str) -> Result<Self> {
        Ok(CachedMap {
            env,
            db: Database::open(env, name, C::KIND)?,
            _codec: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.db.name()
    }

    pub fn get(&self, key: &str) -> Result<Option<C::Item>> {
        self.db
            .get(self.env, key.as_bytes())?
            .map(|value| C::decode(&value))
            .transpose()
    }

    /// Insert a value, returning the one it replaced
    pub fn insert(&self, key: &str, value: C::Item) -> Result<Option<C::Item>> {
        let buf = C::encode(&value)?;
        self.db
            .put(self.env, key.as_bytes(), &buf)?
            .map(|prev| C::decode(&prev))
            .transpose()
    }

    pub fn remove(&self, key: &str) -> Result<Option<C::Item>> {
        self.db
            .del(self.env, key.as_bytes())?
            .map(|prev| C::decode(&prev))
            .transpose()
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.db.contains(self.env, key.as_bytes())
    }

    pub fn len(&self) -> Result<u64> {
        self.db.len(self.env)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.db.is_empty(self.env)
    }

    pub fn clear(&self) -> Result<()> {
        self.db.clear(self.env)
    }

    /// Entries in key byte order
    pub fn iter(&self) -> Result<Iter<'m, C>> {
        Ok(Iter {
            cursor: self.db.cursor(self.env)?,
            _codec: PhantomData,
        })
    }

    pub fn keys(&self) -> Result<Keys<'m>> {
        Ok(Keys {
            cursor: self.db.cursor(self.env)?,
        })
    }
}

#[derive(Debug)]
pub struct Iter<'m, C> {
    cursor: Cursor<'m>,
    _codec: PhantomData<C>,
}

impl<C: Codec> Iterator for Iter<'_, C> {
    type Item = Result<(String, C::Item)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.next()?;
        Some(entry.and_then(|(key, value)| Ok((decode_str(&key)?, C::decode(&value)?))))
    }
}

/// Keys of a map, or members of a set
#[derive(Debug)]
pub struct Keys<'m> {
    cursor: Cursor<'m>,
}

impl Iterator for Keys<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.cursor.next()?;
        Some(entry.and_then(|(key, _)| decode_str(&key)))
    }
}

/// Set of strings
#[derive(Debug)]
pub struct CachedSet<'m> {
    env: &'m Environment,
    db: Database,
}

impl<'m> CachedSet<'m> {
    /// Create-or-open the set called `name`
    pub fn open(env: &'m Environment, name: &str) -> Result<Self> {
        Ok(CachedSet {
            env,
            db: Database::open(env, name, UnitCodec::KIND)?,
        })
    }

    pub fn name(&self) -> &str {
        self.db.name()
    }

    /// Add a member. Returns whether it was newly added.
    pub fn insert(&self, member: &str) -> Result<bool> {
        let empty = UnitCodec::encode(&())?;
        Ok(self.db.put(self.env, member.as_bytes(), &empty)?.is_none())
    }

    pub fn contains(&self, member: &str) -> Result<bool> {
        self.db.contains(self.env, member.as_bytes())
    }

    /// Remove a member. Returns whether it was present.
    pub fn remove(&self, member: &str) -> Result<bool> {
        Ok(self.db.del(self.env, member.as_bytes())?.is_some())
    }

    pub fn len(&self) -> Result<u64> {
        self.db.len(self.env)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.db.is_empty(self.env)
    }

    pub fn clear(&self) -> Result<()> {
        self.db.clear(self.env)
    }

    /// Members in byte order
    pub fn iter(&self) -> Result<Keys<'m>> {
        Ok(Keys {
            cursor: self.db.cursor(self.env)?,
        })
    }
}
