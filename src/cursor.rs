use std::ops::Bound;

use crate::database::Database;
use crate::env::Environment;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    /// Before the first entry
    Start,
    /// Next call returns the first key at or after this one
    AtOrAfter(Vec<u8>),
    /// Next call returns the first key after this one
    After(Vec<u8>),
    End,
}

/// Ordered walk over one database.
///
/// The cursor keeps only its last key, so it sees changes made between
/// steps. Each step takes the environment read lock once.
#[derive(Debug)]
pub struct Cursor<'env> {
    env: &'env Environment,
    db: Database,
    position: Position,
}

impl<'env> Cursor<'env> {
    pub(crate) fn new(env: &'env Environment, db: Database) -> Self {
        Cursor {
            env,
            db,
            position: Position::Start,
        }
    }

    fn step(&mut self, from: Bound<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let found = self.env.inner.read().seek(self.db.raw_dbi(), from);
        match found {
            Ok(Some((key, value))) => {
                self.position = Position::After(key.clone());
                Ok(Some((key, value)))
            }
            Ok(None) => {
                self.position = Position::End;
                Ok(None)
            }
            Err(e) => {
                self.position = Position::End;
                Err(e)
            }
        }
    }

    /// Position at the first entry
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.step(Bound::Unbounded)
    }

    /// Position at the first key greater than or equal to `key`
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.step(Bound::Included(key))
    }

    /// Advance to the next entry
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match std::mem::replace(&mut self.position, Position::End) {
            Position::Start => self.first(),
            Position::AtOrAfter(key) => self.step(Bound::Included(&key)),
            Position::After(key) => self.step(Bound::Excluded(&key)),
            Position::End => Ok(None),
        }
    }

    /// Restart the walk at `key` without reading yet
    pub fn seek(&mut self, key: &[u8]) {
        self.position = Position::AtOrAfter(key.to_vec());
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
