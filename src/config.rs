use std::path::{Path, PathBuf};

use crate::constants::{mmap_supported, EnvFlags, DB_DIR_NAME, DB_FILE_NAME, DEFAULT_MAP_GROWTH};
use crate::env::EnvBuilder;

/// Where and how the cache file is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    base_dir: PathBuf,
    /// Read through a memory map
    mmap: bool,
    /// Zero newly grown file regions
    preclear: bool,
    /// fsync on commit
    sync: bool,
    /// File growth step in bytes
    map_growth: usize,
}

impl CacheConfig {
    /// Defaults: mmap where supported, no preclear, synced commits
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        CacheConfig {
            base_dir: base_dir.into(),
            mmap: mmap_supported(),
            preclear: false,
            sync: true,
            map_growth: DEFAULT_MAP_GROWTH,
        }
    }

    /// Has no effect where memory maps are unsupported
    pub fn mmap(mut self, enabled: bool) -> Self {
        self.mmap = enabled;
        self
    }

    pub fn preclear(mut self, enabled: bool) -> Self {
        self.preclear = enabled;
        self
    }

    pub fn sync(mut self, enabled: bool) -> Self {
        self.sync = enabled;
        self
    }

    /// Steps above 1 GiB make `start` fail
    pub fn map_growth(mut self, bytes: usize) -> Self {
        self.map_growth = bytes;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/db`
    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join(DB_DIR_NAME)
    }

    /// `<base_dir>/db/nna_cache`
    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join(DB_FILE_NAME)
    }

    pub fn env_flags(&self) -> EnvFlags {
        let mut flags = EnvFlags::empty();
        if !self.mmap {
            flags |= EnvFlags::NOMMAP;
        }
        if !self.preclear {
            flags |= EnvFlags::NOMEMINIT;
        }
        if !self.sync {
            flags |= EnvFlags::NOSYNC;
        }
        flags
    }

    pub fn env_builder(&self) -> EnvBuilder {
        EnvBuilder::new()
            .flags(self.env_flags())
            .map_growth(self.map_growth)
    }
}
