use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::constants::{EnvFlags, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{MetaHeader, META_SIZE};
use crate::page::RunPtr;

const ZERO_CHUNK: usize = 64 * 1024;

/// Where the bytes of a committed run live
#[derive(Debug)]
pub(crate) enum RunSource {
    /// A window of the memory map
    Mapped { offset: usize, len: usize },
    /// Read into memory
    Loaded(Vec<u8>),
}

/// Injected I/O failure
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Writes to data pages fail
    DataWrite,
    /// The meta page is written, then an error is reported
    MetaWrite,
    /// Mapping the grown file fails
    Remap,
}

/// The data file plus its optional read-only memory map.
///
/// Writes always go through positioned writes, never through the map.
#[derive(Debug)]
pub(crate) struct DataFile {
    file: File,
    map: Option<Mmap>,
    use_mmap: bool,
    preclear: bool,
    growth: u64,
    len: u64,
    #[cfg(test)]
    pub(crate) fault: Option<Fault>,
}

impl DataFile {
    pub(crate) fn open(path: &Path, flags: EnvFlags, growth: usize) -> Result<Self> {
        let rdonly = flags.contains(EnvFlags::RDONLY);
        let mut options = OpenOptions::new();
        options.read(true).write(!rdonly).create(!rdonly);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let file = options.open(path)?;
        let len = file.metadata()?.len();

        Ok(DataFile {
            file,
            map: None,
            use_mmap: !flags.contains(EnvFlags::NOMMAP),
            preclear: !flags.contains(EnvFlags::NOMEMINIT),
            growth: growth.max(PAGE_SIZE) as u64,
            len,
            #[cfg(test)]
            fault: None,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    pub(crate) fn map_len(&self) -> usize {
        self.map.as_ref().map_or(0, |map| map.len())
    }

    /// Write both meta pages of a brand new file
    pub(crate) fn init(&mut self, meta: &MetaHeader, sync: bool) -> Result<()> {
        self.ensure_len((META_PAGES * PAGE_SIZE) as u64)?;
        let buf = meta.encode();
        for slot in 0..META_PAGES {
            self.write_at((slot * PAGE_SIZE) as u64, &buf)?;
        }
        if sync {
            self.sync()?;
        }
        Ok(())
    }

    pub(crate) fn read_meta(&self, slot: usize) -> Result<MetaHeader> {
        let mut buf = [0u8; META_SIZE];
        self.read_at((slot * PAGE_SIZE) as u64, &mut buf)?;
        MetaHeader::decode(&buf)
    }

    pub(crate) fn write_meta(&self, meta: &MetaHeader) -> Result<()> {
        self.write_at((meta.slot() * PAGE_SIZE) as u64, &meta.encode())?;
        #[cfg(test)]
        {
            if self.fault == Some(Fault::MetaWrite) {
                return Err(io::Error::new(io::ErrorKind::Other, "injected meta fault").into());
            }
        }
        Ok(())
    }

    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, buf, offset).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::Corrupted("read past end of file"),
            _ => Error::Io(e),
        })
    }

    pub(crate) fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        #[cfg(test)]
        {
            if self.fault == Some(Fault::DataWrite) && offset >= (META_PAGES * PAGE_SIZE) as u64 {
                return Err(io::Error::new(io::ErrorKind::Other, "injected write fault").into());
            }
        }
        write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Grow the file to at least `len` bytes, in `growth` steps.
    ///
    /// Returns whether the file grew.
    pub(crate) fn ensure_len(&mut self, len: u64) -> Result<bool> {
        if len <= self.len {
            return Ok(false);
        }
        let new_len = len.div_ceil(self.growth) * self.growth;
        let old_len = self.len;
        self.file.set_len(new_len)?;
        self.len = new_len;
        if self.preclear {
            let zeros = vec![0u8; ZERO_CHUNK];
            let mut offset = old_len;
            while offset < new_len {
                let n = ZERO_CHUNK.min((new_len - offset) as usize);
                self.write_at(offset, &zeros[..n])?;
                offset += n as u64;
            }
        }
        log::debug!("data file grew from {} to {} bytes", old_len, new_len);
        Ok(true)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Map the whole file, replacing any previous mapping
    pub(crate) fn remap(&mut self) -> Result<()> {
        if !self.use_mmap {
            return Ok(());
        }
        #[cfg(test)]
        {
            if self.fault == Some(Fault::Remap) {
                self.map = None;
                return Err(io::Error::new(io::ErrorKind::Other, "injected remap fault").into());
            }
        }
        if self.map_len() as u64 == self.len {
            return Ok(());
        }
        // Drop the old mapping before creating the new one.
        self.map = None;
        let map = unsafe { MmapOptions::new().len(self.len as usize).map(&self.file)? };
        self.map = Some(map);
        Ok(())
    }

    /// Locate a committed run and verify its checksum
    pub(crate) fn resolve(&self, ptr: &RunPtr) -> Result<RunSource> {
        if ptr.is_empty() {
            return Ok(RunSource::Loaded(Vec::new()));
        }
        let len = usize::try_from(ptr.len).map_err(|_| Error::Corrupted("run length"))?;
        let source = match &self.map {
            Some(_) => RunSource::Mapped {
                offset: ptr.offset(),
                len,
            },
            None => {
                let mut buf = vec![0u8; len];
                self.read_at(ptr.offset() as u64, &mut buf)?;
                RunSource::Loaded(buf)
            }
        };
        if crc32fast::hash(self.bytes(&source)?) != ptr.crc {
            return Err(Error::Corrupted("run checksum"));
        }
        Ok(source)
    }

    pub(crate) fn bytes<'a>(&'a self, source: &'a RunSource) -> Result<&'a [u8]> {
        match source {
            RunSource::Loaded(buf) => Ok(buf.as_slice()),
            RunSource::Mapped { offset, len } => self
                .map
                .as_ref()
                .and_then(|map| map.get(*offset..offset + len))
                .ok_or(Error::Corrupted("run outside the mapped file")),
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
