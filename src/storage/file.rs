//! The on-disk file handle and the memory map placed over it.
//!
//! Growth follows a doubling strategy up to 1 GiB, then grows in fixed 1 GiB
//! increments past that -- the same shape as `StorageInner::expand` in the
//! allocator this crate's pager is grounded on, chosen so that small
//! databases don't pay for a huge initial mapping while large databases
//! don't need to remap on every page allocation.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions};

/// Mappings grow by doubling until they reach this size.
const DOUBLING_CEILING: u64 = 1 << 30; // 1 GiB
/// Past the doubling ceiling, mappings grow in fixed increments of this size.
const GROWTH_INCREMENT: u64 = 1 << 30; // 1 GiB

/// Owns the data file and the read/write memory map over it.
///
/// Remapping drops the old `MmapMut` before creating the new one; callers
/// must not hold raw pointers derived from a previous mapping across a call
/// to [`FileHandle::ensure_capacity`].
pub struct FileHandle {
    file: File,
    mmap: Option<MmapMut>,
    read_only: bool,
    len: u64,
}

impl FileHandle {
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;

        if read_only {
            FileExt::lock_shared(&file)?;
        } else {
            FileExt::lock_exclusive(&file)?;
        }

        let len = file.metadata()?.len();
        Ok(FileHandle {
            file,
            mmap: None,
            read_only,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Grows the backing file (if needed) and remaps so that at least
    /// `min_len` bytes are addressable. No-op if the current mapping is
    /// already large enough.
    pub fn ensure_capacity(&mut self, min_len: u64) -> io::Result<()> {
        if self.len >= min_len && self.mmap.is_some() {
            return Ok(());
        }

        let mut new_len = self.len.max(1);
        while new_len < min_len {
            new_len = if new_len < DOUBLING_CEILING {
                (new_len * 2).min(DOUBLING_CEILING)
            } else {
                new_len + GROWTH_INCREMENT
            };
        }

        self.file.set_len(new_len)?;
        self.len = new_len;

        // Drop the old mapping before creating the new one: two live mmaps
        // over the same file on the same fd are fine, but we only ever want
        // one to exist so stale pointers can't outlive a remap.
        self.mmap = None;
        let mmap = unsafe { MmapOptions::new().len(new_len as usize).map_mut(&self.file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_ref().expect("mmap not initialized").as_ref()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mmap.as_mut().expect("mmap not initialized").as_mut()
    }

    pub fn flush(&self) -> io::Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        Ok(())
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush_range(offset, len)?;
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn ensure_capacity_grows_by_doubling() {
        let dir = TempDir::new("crucible-file").unwrap();
        let path = dir.path().join("data");
        let mut fh = FileHandle::open(&path, false).unwrap();
        fh.ensure_capacity(4096).unwrap();
        assert!(fh.len() >= 4096);
        assert!(fh.len().is_power_of_two());
    }

    #[test]
    fn ensure_capacity_is_idempotent() {
        let dir = TempDir::new("crucible-file").unwrap();
        let path = dir.path().join("data");
        let mut fh = FileHandle::open(&path, false).unwrap();
        fh.ensure_capacity(4096).unwrap();
        let len = fh.len();
        fh.ensure_capacity(4096).unwrap();
        assert_eq!(fh.len(), len);
    }

    #[test]
    fn write_and_reopen_round_trips_bytes() {
        let dir = TempDir::new("crucible-file").unwrap();
        let path = dir.path().join("data");
        {
            let mut fh = FileHandle::open(&path, false).unwrap();
            fh.ensure_capacity(4096).unwrap();
            fh.as_mut_slice()[0..4].copy_from_slice(&[1, 2, 3, 4]);
            fh.flush().unwrap();
        }
        let mut fh = FileHandle::open(&path, false).unwrap();
        fh.ensure_capacity(4096).unwrap();
        assert_eq!(&fh.as_slice()[0..4], &[1, 2, 3, 4]);
    }
}
