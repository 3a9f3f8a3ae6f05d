//! `crucible`: an embedded, single-file key-value store with MVCC snapshot
//! isolation and copy-on-write B+Tree pages.
//!
//! A database lives in three files next to `path`: the data file itself,
//! `<path>-wal` (the write-ahead log), and `<path>-shm` (a small
//! cross-process coordination segment). [`Env::open`] opens all three;
//! [`Env::update`] runs a single read/write transaction, [`Env::view`] runs
//! a read-only snapshot transaction, and any number of view transactions may
//! run concurrently with the one update transaction that is allowed to be
//! open at a time.
//!
//! ```no_run
//! use crucible::{Env, Options};
//!
//! # fn main() -> Result<(), crucible::Error> {
//! let env = Env::open("example.db", Options::default())?;
//! env.update(|tx| {
//!     let mut bucket = tx.user_bucket();
//!     bucket.put(b"hello", b"world")?;
//!     tx.apply(bucket.root());
//!     Ok(())
//! })?;
//! env.view(|tx| {
//!     let bucket = tx.user_bucket();
//!     assert_eq!(bucket.get(b"hello")?, Some(b"world".to_vec()));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```
pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub use storage::bucket::{Bucket, Cursor};
pub use storage::error::{Error, InvalidArgumentError, LoggerError, MetaError, PagerError, TxManagerError};
pub use storage::meta::{BucketId, PageId, SlotId, TxId};
pub use storage::node::{lexicographic, u32_be, u64_be, Comparator};
pub use storage::options::{Options, SyncMode};
pub use storage::tx::{UpdateTx, ViewTx};

use log::info;
use storage::file::FileHandle;
use storage::meta::{Meta, META_ENCODED_LEN, META_PAGE_COUNT};
use storage::pager::Pager;
use storage::shm::Shm;
use storage::tx::TxManager;
use storage::wal::{Logger, RecoveredOp};

struct Inner {
    pager: Pager,
    meta: Meta,
    meta_slot: bool, // which of the two meta pages holds `meta`
    tx_manager: TxManager,
    logger: Logger,
    next_txid: u64,
}

/// An open database. Cheap to share across threads behind an `Arc`; all
/// mutable state is behind a single internal mutex (see the module-level
/// note on the concurrency model this implementation chose).
pub struct Env {
    path: PathBuf,
    options: Options,
    inner: Mutex<Inner>,
    shm: Shm,
}

fn wal_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push("-wal");
    PathBuf::from(s)
}

fn shm_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push("-shm");
    PathBuf::from(s)
}

impl Env {
    /// Opens (creating if necessary, unless [`Options::read_only`]) the
    /// database at `path`. Replays any committed-but-not-checkpointed WAL
    /// entries before returning.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self, Error> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut file = FileHandle::open(&path, options.read_only)?;
        let is_new = file.is_empty();

        let meta_region_len = options.page_size as u64 * META_PAGE_COUNT as u64;
        file.ensure_capacity(meta_region_len)?;

        let (mut meta, meta_slot, page_count) = if is_new {
            let meta = Meta::new(options.page_size);
            (meta, false, META_PAGE_COUNT)
        } else {
            let (a, b) = {
                let buf = file.as_slice();
                (
                    buf[0..META_ENCODED_LEN].to_vec(),
                    buf[options.page_size as usize..options.page_size as usize + META_ENCODED_LEN].to_vec(),
                )
            };
            let (meta, slot_b) = Meta::choose_current(&a, &b)?;
            let page_count = meta.page_count;
            (meta, slot_b, page_count)
        };

        let page_count = page_count.max(META_PAGE_COUNT);
        file.ensure_capacity(page_count as u64 * options.page_size as u64)?;
        let mut pager = Pager::new(file, options.page_size, page_count);
        pager.load_free_list(&meta)?;

        let logger = Logger::open(&wal_path(&path), options.max_wal_size)?;
        let recovered = Logger::recover(&wal_path(&path))?;
        let mut next_txid = meta.txid.0 + 1;
        for tx in &recovered {
            if tx.txid.0 >= next_txid {
                next_txid = tx.txid.0 + 1;
            }
        }

        if !recovered.is_empty() && !options.read_only {
            info!("crucible: replaying {} recovered transaction(s)", recovered.len());
            for tx in recovered {
                apply_recovered(&mut pager, &mut meta, options.comparator, tx)?;
            }
            write_meta(&mut pager, &mut meta, meta_slot)?;
        }

        let tx_manager = TxManager::new(meta.txid);
        let shm = Shm::open(&shm_path(&path))?;
        shm.connect();
        shm.publish_meta(&meta);

        Ok(Env {
            path,
            options,
            inner: Mutex::new(Inner {
                pager,
                meta,
                meta_slot,
                tx_manager,
                logger,
                next_txid,
            }),
            shm,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// Runs `f` in a read-only snapshot transaction against the most
    /// recently committed state.
    pub fn view<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut ViewTx<'_>) -> Result<T, Error>,
    {
        let (meta, txid) = {
            let mut guard = self.inner.lock().unwrap();
            let txid = guard.meta.txid;
            guard.tx_manager.begin_view(txid);
            (guard.meta, txid)
        };
        let result = {
            let guard = self.inner.lock().unwrap();
            let mut tx = ViewTx::new(&guard.pager, self.options.comparator, meta);
            f(&mut tx)
        };
        let mut guard = self.inner.lock().unwrap();
        guard.tx_manager.end_view(txid);
        let safe_txid = guard.tx_manager.min_view_txid();
        guard.pager.release(safe_txid);
        result
    }

    /// Runs `f` in the single read/write transaction. Returning `Err` (or
    /// panicking, or `f` returning normally without the caller having
    /// dropped the `UpdateTx` mid-way) rolls back; returning `Ok` commits.
    pub fn update<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut UpdateTx<'_>) -> Result<T, Error>,
    {
        if self.options.read_only {
            return Err(InvalidArgumentError::ReadOnly.into());
        }
        let mut guard = self.inner.lock().unwrap();
        guard.tx_manager.begin_update()?;
        let txid = TxId(guard.next_txid);
        guard.next_txid += 1;
        guard.logger.begin(txid)?;

        let root = guard.meta.user_root;
        let (result, new_root) = {
            let pager = &mut guard.pager;
            let logger = &mut guard.logger;
            let mut tx = UpdateTx::new(pager, self.options.comparator, txid, root, logger);
            let result = f(&mut tx);
            let new_root = tx.root();
            let finished_txid = tx.finish();
            debug_assert_eq!(finished_txid, txid);
            (result, new_root)
        };

        match result {
            Ok(value) => {
                guard.logger.commit()?;
                guard.meta.user_root = new_root;
                guard.meta.txid = txid;
                guard.pager.commit();
                let meta_slot = !guard.meta_slot;
                let page_count = guard.pager.page_count();
                guard.meta.page_count = page_count;
                write_meta(&mut guard.pager, &mut guard.meta, meta_slot)?;
                guard.meta_slot = meta_slot;
                guard.tx_manager.commit_update(txid);
                self.shm.publish_meta(&guard.meta);

                if guard.logger.should_checkpoint() {
                    checkpoint(&mut guard)?;
                }
                Ok(value)
            }
            Err(e) => {
                guard.logger.rollback()?;
                guard.pager.rollback(txid);
                guard.tx_manager.rollback_update();
                Err(e)
            }
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.shm.disconnect();
    }
}

fn write_meta(pager: &mut Pager, meta: &mut Meta, slot: bool) -> Result<(), Error> {
    pager.save_free_list(meta)?;
    let page_size = pager.page_size() as usize;
    let mut buf = vec![0u8; META_ENCODED_LEN];
    meta.encode(&mut buf);
    let offset = if slot { page_size } else { 0 };
    let file_slice = pager.file.as_mut_slice();
    file_slice[offset..offset + META_ENCODED_LEN].copy_from_slice(&buf);
    pager.file.flush_range(offset, META_ENCODED_LEN)?;
    Ok(())
}

/// The checkpoint protocol: every dirty page and the free list are already
/// durable by the time this runs (they were written directly through the
/// mmap by the transaction that produced them), so all that remains is
/// truncating the WAL. Meta itself is only ever toggled between its two
/// alternating slots by [`write_meta`], which already happened before this
/// is called -- this function exists as the named seam a caller can hook to
/// observe or force a checkpoint independent of size-triggered ones.
fn checkpoint(inner: &mut Inner) -> Result<(), Error> {
    inner.pager.file.sync_all()?;
    inner.logger.checkpoint_complete()?;
    Ok(())
}

fn apply_recovered(
    pager: &mut Pager,
    meta: &mut Meta,
    cmp: Comparator,
    tx: storage::wal::RecoveredTx,
) -> Result<(), Error> {
    let mut next_bucket_id = 0u32;
    let mut bucket = Bucket::new(pager, cmp, tx.txid, meta.user_root, &mut next_bucket_id, None);
    for op in tx.ops {
        match op {
            RecoveredOp::Put { key, value, is_bucket } => {
                if is_bucket {
                    // Bucket roots recovered verbatim; the SubBucket op that
                    // follows carries the authoritative root page id.
                    continue;
                }
                bucket.put(&key, &value)?;
            }
            RecoveredOp::Delete { key } => {
                bucket.delete(&key)?;
            }
            RecoveredOp::SubBucket { name, root, .. } => {
                bucket.sub_bucket(&name)?;
                bucket.close_sub_bucket(&name, root);
            }
        }
    }
    bucket.flush_sub_buckets()?;
    meta.user_root = bucket.root();
    meta.txid = tx.txid;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn open_update_view_round_trip() {
        let dir = TempDir::new("crucible-env").unwrap();
        let env = Env::open(dir.path().join("data"), Options::default()).unwrap();
        env.update(|tx| {
            let mut bucket = tx.user_bucket();
            bucket.put(b"hello", b"world")?;
            tx.apply(bucket.root());
            Ok(())
        })
        .unwrap();

        env.view(|tx| {
            let bucket = tx.user_bucket();
            assert_eq!(bucket.get(b"hello")?, Some(b"world".to_vec()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn rollback_on_error_discards_writes() {
        let dir = TempDir::new("crucible-env").unwrap();
        let env = Env::open(dir.path().join("data"), Options::default()).unwrap();
        let result: Result<(), Error> = env.update(|tx| {
            let mut bucket = tx.user_bucket();
            bucket.put(b"hello", b"world")?;
            tx.apply(bucket.root());
            Err(InvalidArgumentError::EmptyKey.into())
        });
        assert!(result.is_err());

        env.view(|tx| {
            let bucket = tx.user_bucket();
            assert_eq!(bucket.get(b"hello")?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reopen_recovers_committed_data() {
        let dir = TempDir::new("crucible-env").unwrap();
        let path = dir.path().join("data");
        {
            let env = Env::open(&path, Options::default()).unwrap();
            env.update(|tx| {
                let mut bucket = tx.user_bucket();
                bucket.put(b"a", b"1")?;
                tx.apply(bucket.root());
                Ok(())
            })
            .unwrap();
        }
        let env = Env::open(&path, Options::default()).unwrap();
        env.view(|tx| {
            let bucket = tx.user_bucket();
            assert_eq!(bucket.get(b"a")?, Some(b"1".to_vec()));
            Ok(())
        })
        .unwrap();
    }
}
