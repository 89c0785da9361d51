//! A single memory-mapped file, opened or created at a fixed size.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates `path` fresh at exactly `len` bytes and maps it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        map.advise(memmap2::Advice::Sequential)?;
        Ok(Self { file, map, len })
    }

    /// Opens an existing file and maps exactly its current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        map.advise(memmap2::Advice::Sequential)?;
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    /// Returns a mutable view of `[offset, offset+len)` through a shared
    /// reference.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other live reference overlaps this byte
    /// range for as long as the returned slice is used. The segment's
    /// claim protocol establishes this by construction: a thread only
    /// calls this once it holds exclusive ownership of that range via a
    /// successful CAS on the write-offset pair, and the one field shared
    /// with readers (a frame's `flags`) is always accessed through an
    /// atomic reinterpretation rather than through this slice.
    pub unsafe fn range_mut_shared(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        let ptr = self.map.as_ptr().add(offset) as *mut u8;
        Ok(std::slice::from_raw_parts_mut(ptr, len))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes `[offset, offset+len)` synchronously, i.e. `msync(MS_SYNC)`.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.map.flush_range(offset, len)?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }
}
