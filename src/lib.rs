//! Persistent named maps and sets backed by a single memory-mapped file.

mod codec;
mod collections;
mod config;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod file;
mod freelist;
mod manager;
mod meta;
mod page;
mod transaction;
mod types;

pub use codec::{Codec, I64Codec, NestedMapCodec, StrCodec, UnitCodec};
pub use collections::{CachedMap, CachedSet, Iter, Keys, LongMap, MapToMap, StringMap};
pub use config::CacheConfig;
pub use constants::{EnvFlags, DB_DIR_NAME, DB_FILE_NAME, PAGE_SIZE};
pub use cursor::Cursor;
pub use database::Database;
pub use env::{EnvBuilder, Environment};
pub use error::{Error, Result};
pub use manager::CacheManager;
pub use types::{DbKind, DbStat, EnvInfo, Stat};
