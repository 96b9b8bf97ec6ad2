use std::io;
use std::path::PathBuf;
use std::result;

use thiserror::Error;

use crate::types::DbKind;

/// Custom result type for cache operations
pub type Result<T> = result::Result<T, Error>;

/// Cache error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Directory creation, open, read, write or sync failed
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    /// Update of meta page failed; the environment must be reopened
    #[error("update of meta page failed, reopen the environment")]
    Panic,
    /// File is not a valid cache file
    #[error("file is not a valid cache database")]
    Invalid,
    /// Database version mismatch
    #[error("database version mismatch: found {found:#x}, expected {expected:#x}")]
    VersionMismatch { found: u32, expected: u32 },
    /// Database file is corrupted
    #[error("database file is corrupted: {0}")]
    Corrupted(&'static str),
    /// Environment is already open
    #[error("environment is already open: {}", .0.display())]
    EnvAlreadyOpen(PathBuf),
    /// Environment is not started, or was stopped
    #[error("environment is not started")]
    EnvClosed,
    /// Environment is read-only
    #[error("environment is read-only")]
    EnvReadOnly,
    /// Invalid environment configuration
    #[error("invalid environment configuration: {0}")]
    EnvInvalidConfig(&'static str),
    /// Environment flags cannot be modified
    #[error("environment flags cannot be modified after open")]
    EnvFlagsImmutable,
    /// The database handle belongs to another environment
    #[error("database handle does not belong to this environment")]
    BadDbi,
    /// A name was reopened with a different container kind
    #[error("container {name:?} is a {found}, not a {expected}")]
    Incompatible {
        name: String,
        expected: DbKind,
        found: DbKind,
    },
    /// Unsupported size of key or value
    #[error("key or value too large: {0} bytes")]
    BadValSize(usize),
    /// Container names must be non-empty
    #[error("invalid container name: {0:?}")]
    BadName(String),
    /// A stored key or value could not be decoded
    #[error("decode failed: {0}")]
    Decode(&'static str),
    /// A nested map could not be decoded
    #[error("nested map: {0}")]
    Bitcode(#[from] bitcode::Error),
}
