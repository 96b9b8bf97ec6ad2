use std::fs;

use crate::collections::{CachedSet, LongMap, MapToMap, StringMap};
use crate::config::CacheConfig;
use crate::env::Environment;
use crate::error::{Error, Result};

/// Owns the cache file and hands out named containers backed by it.
///
/// Containers borrow the manager, so `stop` cannot run while any of them is
/// alive. Changes become durable on [`CacheManager::commit`].
#[derive(Debug, Default)]
pub struct CacheManager {
    env: Option<Environment>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.env.is_some()
    }

    /// The open environment, or `EnvClosed`
    pub fn environment(&self) -> Result<&Environment> {
        self.env.as_ref().ok_or(Error::EnvClosed)
    }

    /// Open `<base_dir>/db/nna_cache`, creating the directory if needed
    pub fn start(&mut self, config: &CacheConfig) -> Result<()> {
        if let Some(env) = &self.env {
            return Err(Error::EnvAlreadyOpen(env.path().to_path_buf()));
        }
        let db_dir = config.db_dir();
        if !db_dir.is_dir() {
            fs::create_dir_all(&db_dir)?;
            log::info!("created cache directory {}", db_dir.display());
        }
        let env = config.env_builder().open(config.db_path())?;
        log::info!("cache started in {}", config.base_dir().display());
        self.env = Some(env);
        Ok(())
    }

    /// String -> i64 map
    pub fn cached_map(&self, name: &str) -> Result<LongMap<'_>> {
        LongMap::open(self.environment()?, name)
    }

    /// String -> String map
    pub fn cached_string_map(&self, name: &str) -> Result<StringMap<'_>> {
        StringMap::open(self.environment()?, name)
    }

    /// String -> (String -> i64) map
    pub fn cached_map_to_map(&self, name: &str) -> Result<MapToMap<'_>> {
        MapToMap::open(self.environment()?, name)
    }

    pub fn cached_set(&self, name: &str) -> Result<CachedSet<'_>> {
        CachedSet::open(self.environment()?, name)
    }

    /// Make every pending change durable
    pub fn commit(&self) -> Result<()> {
        self.environment()?.commit()?;
        Ok(())
    }

    /// Discard every pending change
    pub fn rollback(&self) -> Result<()> {
        self.environment()?.rollback();
        Ok(())
    }

    /// Close the cache file. Uncommitted changes are lost.
    pub fn stop(&mut self) {
        if let Some(env) = self.env.take() {
            env.close();
            log::info!("cache stopped");
        }
    }
}
