//! The `<path>-shm` sidecar segment used to coordinate multiple processes
//! attached to the same database: a connection count, the single-writer
//! lock, a lock guarding the in-memory mirror of the current meta, and the
//! mirror itself (so a newly attaching reader can find the current txid
//! without first touching the data file).
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use super::meta::{Meta, META_ENCODED_LEN};

const SPIN_ITERS: u32 = 1024;

/// A simple cross-process spinlock backed by an `AtomicU32` living in shared
/// memory. Not fair and not reentrant; critical sections guarded by it must
/// stay short (copying a `Meta`, incrementing a counter).
#[repr(transparent)]
pub struct RawMutex(AtomicU32);

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

impl RawMutex {
    pub fn lock(&self) -> RawMutexGuard<'_> {
        let mut spins = 0u32;
        loop {
            if self
                .0
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RawMutexGuard { mutex: self };
            }
            spins += 1;
            if spins > SPIN_ITERS {
                std::thread::yield_now();
            }
        }
    }
}

pub struct RawMutexGuard<'a> {
    mutex: &'a RawMutex,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.0.store(UNLOCKED, Ordering::Release);
    }
}

/// Fixed layout of the shm segment. `#[repr(C)]` so the byte offsets are
/// stable across the processes sharing the mapping.
#[repr(C)]
struct ShmLayout {
    connections: AtomicU32,
    update_lock: RawMutex,
    meta_lock: RawMutex,
    meta_mirror: [u8; META_ENCODED_LEN],
}

pub const SHM_LEN: usize = std::mem::size_of::<ShmLayout>();

pub struct Shm {
    mmap: MmapMut,
}

impl Shm {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < SHM_LEN as u64 {
            file.set_len(SHM_LEN as u64)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Shm { mmap })
    }

    fn layout(&self) -> &ShmLayout {
        unsafe { &*(self.mmap.as_ptr() as *const ShmLayout) }
    }

    pub fn connect(&self) -> u32 {
        self.layout().connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn disconnect(&self) -> u32 {
        self.layout().connections.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn connection_count(&self) -> u32 {
        self.layout().connections.load(Ordering::Acquire)
    }

    /// Acquires the single-writer lock. Held for the lifetime of an update
    /// transaction.
    pub fn lock_writer(&self) -> RawMutexGuard<'_> {
        self.layout().update_lock.lock()
    }

    /// Publishes `meta` into the shared mirror under the meta lock, so other
    /// processes can discover the new current txid without racing the data
    /// file's own two meta pages.
    pub fn publish_meta(&self, meta: &Meta) {
        let _guard = self.layout().meta_lock.lock();
        let layout = unsafe { &mut *(self.mmap.as_ptr() as *mut ShmLayout) };
        meta.encode(&mut layout.meta_mirror);
    }

    pub fn read_meta(&self) -> Option<Meta> {
        let _guard = self.layout().meta_lock.lock();
        Meta::decode(&self.layout().meta_mirror).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn connect_and_disconnect_track_count() {
        let dir = TempDir::new("crucible-shm").unwrap();
        let shm = Shm::open(&dir.path().join("data-shm")).unwrap();
        assert_eq!(shm.connect(), 1);
        assert_eq!(shm.connect(), 2);
        assert_eq!(shm.disconnect(), 1);
        assert_eq!(shm.connection_count(), 1);
    }

    #[test]
    fn publish_and_read_meta_round_trips() {
        let dir = TempDir::new("crucible-shm").unwrap();
        let shm = Shm::open(&dir.path().join("data-shm")).unwrap();
        let mut meta = Meta::new(4096);
        meta.txid = super::super::meta::TxId(9);
        shm.publish_meta(&meta);
        let read = shm.read_meta().expect("valid meta");
        assert_eq!(read.txid, meta.txid);
    }

    #[test]
    fn writer_lock_excludes_reentry_from_a_second_handle() {
        let dir = TempDir::new("crucible-shm").unwrap();
        let shm = Shm::open(&dir.path().join("data-shm")).unwrap();
        let guard = shm.lock_writer();
        drop(guard);
        // Lock is released on drop, so acquiring again must succeed.
        let _guard2 = shm.lock_writer();
    }
}
