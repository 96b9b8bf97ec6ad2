use std::fmt;
use std::path::PathBuf;

/// Container kind tag, persisted in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DbKind {
    /// String -> i64
    LongMap = 1,
    /// String -> String
    StringMap = 2,
    /// String -> (String -> i64)
    MapToMap = 3,
    /// Set of String
    StringSet = 4,
}

impl DbKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DbKind::LongMap),
            2 => Some(DbKind::StringMap),
            3 => Some(DbKind::MapToMap),
            4 => Some(DbKind::StringSet),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DbKind::LongMap => "long map",
            DbKind::StringMap => "string map",
            DbKind::MapToMap => "map-to-map",
            DbKind::StringSet => "string set",
        };
        f.write_str(name)
    }
}

/// Environment statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Last committed transaction
    pub txn_id: u64,
    /// First page never handed out
    pub last_pgno: u64,
    /// Pages on the free list
    pub free_pages: u64,
    /// Number of named databases
    pub databases: usize,
}

/// Per-database statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStat {
    pub kind: DbKind,
    /// Live entries, pending changes included
    pub entries: u64,
    /// Pages held by the committed run
    pub pages: u64,
    /// Bytes of the committed run
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub path: PathBuf,
    pub mapsize: usize,
    pub mapped: bool,
    pub last_pgno: u64,
    pub last_txnid: u64,
    pub dirty: bool,
}
