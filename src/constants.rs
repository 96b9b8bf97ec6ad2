use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        /// Don't fsync after commit
        const NOSYNC = 0x10000;
        /// Open an existing file read-only
        const RDONLY = 0x20000;
        /// Read through positioned reads instead of a memory map
        const NOMMAP = 0x40000;
        /// Don't zero newly grown regions of the data file
        const NOMEMINIT = 0x1000000;
    }
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number for cache files
pub const MDB_MAGIC: u32 = 0xBEEF_CA5E;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 1;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 0;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;
/// Packed on-disk version
pub const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;
/// Internal constants
pub const META_PAGES: usize = 2;
/// Default file growth step, 1 MiB
pub const DEFAULT_MAP_GROWTH: usize = 1 << 20;
/// Largest accepted growth step, 1 GiB
pub const MAX_MAP_GROWTH: usize = 1 << 30;
/// Subdirectory of the base dir that holds the cache file
pub const DB_DIR_NAME: &str = "db";
/// Cache file name
pub const DB_FILE_NAME: &str = "nna_cache";

/// Memory maps are only used where the address space is wide enough.
pub const fn mmap_supported() -> bool {
    cfg!(target_pointer_width = "64")
}
