//! Named, independently rooted keyspaces within one database, with support
//! for nesting. A sub-bucket's root is stored as an ordinary leaf value in
//! its parent bucket's B+Tree, flagged `is_bucket_value`, so nesting needs
//! no separate index structure -- just a `BucketId` handed out when the
//! sub-bucket is first materialized in memory.
use std::collections::HashMap;

use super::btree::{BTree, Comparator, Lookup};
use super::error::{Error, PagerError};
use super::meta::{BucketId, PageId, TxId};
use super::pager::Pager;
use super::wal::Logger;

/// An entry in a [`Bucket`]'s sub-bucket cache: the id handed out for this
/// transaction, and the root page as of the last flush (or materialization).
struct SubBucketEntry {
    bucket_id: BucketId,
    root: PageId,
    dirty: bool,
}

/// A single keyspace. `Bucket` borrows the pager and comparator for the
/// duration of one transaction; its root travels with the transaction
/// (through [`super::tx::UpdateTx`]/[`super::tx::ViewTx`]) rather than being
/// owned here.
pub struct Bucket<'a> {
    pager: &'a mut Pager,
    cmp: Comparator,
    txid: TxId,
    root: PageId,
    sub_buckets: HashMap<Vec<u8>, SubBucketEntry>,
    next_bucket_id: &'a mut u32,
    /// The WAL logger for this transaction, if this bucket's mutations
    /// should be durable. `None` for read-only views and for recovery
    /// replay, where logging the replayed ops would be circular.
    logger: Option<&'a mut Logger>,
}

pub struct Cursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl Cursor {
    pub fn next(&mut self) -> Option<(&[u8], &[u8])> {
        let (k, v) = self.entries.get(self.pos)?;
        self.pos += 1;
        Some((k.as_slice(), v.as_slice()))
    }
}

impl<'a> Bucket<'a> {
    pub fn new(
        pager: &'a mut Pager,
        cmp: Comparator,
        txid: TxId,
        root: PageId,
        next_bucket_id: &'a mut u32,
        logger: Option<&'a mut Logger>,
    ) -> Self {
        Bucket {
            pager,
            cmp,
            txid,
            root,
            sub_buckets: HashMap::new(),
            next_bucket_id,
            logger,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let tree = BTree::new(self.pager, self.cmp, self.txid);
        match tree.get(self.root, key)? {
            Some(Lookup::Inline(v)) => Ok(Some(v)),
            Some(Lookup::Bucket { .. }) => Ok(None), // a sub-bucket name is not a value
            None => Ok(None),
        }
    }

    /// Returns the first key greater than or equal to `key`, along with its
    /// value. Used for range scans and prefix seeks.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        let mut cursor = self.iter()?;
        while let Some((k, v)) = cursor.next() {
            if (self.cmp)(k, key) != std::cmp::Ordering::Less {
                return Ok(Some((k.to_vec(), v.to_vec())));
            }
        }
        Ok(None)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut tree = BTree::new(self.pager, self.cmp, self.txid);
        self.root = tree.insert(self.root, key, value)?;
        if let Some(logger) = self.logger.as_deref_mut() {
            logger.put(key, value, false)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        let mut tree = BTree::new(self.pager, self.cmp, self.txid);
        self.root = tree.delete(self.root, key)?;
        if let Some(logger) = self.logger.as_deref_mut() {
            logger.delete(key)?;
        }
        Ok(())
    }

    /// Materializes (or creates) the named sub-bucket, returning its current
    /// in-memory id. Lazy: a sub-bucket isn't read from the parent tree
    /// until something actually asks for it.
    pub fn sub_bucket(&mut self, name: &[u8]) -> Result<BucketId, Error> {
        if let Some(entry) = self.sub_buckets.get(name) {
            return Ok(entry.bucket_id);
        }
        let tree = BTree::new(self.pager, self.cmp, self.txid);
        let root = match tree.get(self.root, name)? {
            Some(Lookup::Bucket { bucket_root }) => bucket_root,
            _ => PageId::INVALID,
        };
        let bucket_id = BucketId(*self.next_bucket_id);
        *self.next_bucket_id += 1;
        self.sub_buckets.insert(
            name.to_vec(),
            SubBucketEntry { bucket_id, root, dirty: false },
        );
        Ok(bucket_id)
    }

    /// Opens a handle to a previously materialized sub-bucket by name. Any
    /// mutation through the returned `Bucket` must be flushed back with
    /// [`Bucket::close_sub_bucket`] before commit.
    pub fn open_sub_bucket(&mut self, name: &[u8]) -> Result<Bucket<'_>, Error> {
        self.sub_bucket(name)?;
        let root = self.sub_buckets.get(name).unwrap().root;
        Ok(Bucket {
            pager: self.pager,
            cmp: self.cmp,
            txid: self.txid,
            root,
            sub_buckets: HashMap::new(),
            next_bucket_id: self.next_bucket_id,
            logger: self.logger.as_deref_mut(),
        })
    }

    /// Records a sub-bucket's new root after it has been mutated, ready to
    /// be flushed into this bucket's own tree at commit time by
    /// [`Bucket::flush_sub_buckets`].
    pub fn close_sub_bucket(&mut self, name: &[u8], new_root: PageId) {
        if let Some(entry) = self.sub_buckets.get_mut(name) {
            entry.root = new_root;
            entry.dirty = true;
        }
    }

    /// Recursively deletes a sub-bucket and everything nested beneath it.
    /// Per-key frees cascade through [`BTree::delete`]'s own page
    /// reclamation; this just needs to walk every key in the sub-bucket and
    /// delete it so nested sub-buckets get the same treatment.
    pub fn delete_sub_bucket(&mut self, name: &[u8]) -> Result<(), Error> {
        let bucket_id = self.sub_bucket(name)?;
        let root = self.sub_buckets.get(name).unwrap().root;
        let keys: Vec<Vec<u8>> = {
            let mut child = Bucket {
                pager: self.pager,
                cmp: self.cmp,
                txid: self.txid,
                root,
                sub_buckets: HashMap::new(),
                next_bucket_id: self.next_bucket_id,
                logger: None,
            };
            let mut cursor = child.iter()?;
            let mut keys = Vec::new();
            while let Some((k, _)) = cursor.next() {
                keys.push(k.to_vec());
            }
            keys
        };

        for key in keys {
            let is_nested_bucket = {
                let tree = BTree::new(self.pager, self.cmp, self.txid);
                matches!(tree.get(root, &key)?, Some(Lookup::Bucket { .. }))
            };
            if is_nested_bucket {
                let mut child = Bucket {
                    pager: self.pager,
                    cmp: self.cmp,
                    txid: self.txid,
                    root,
                    sub_buckets: HashMap::new(),
                    next_bucket_id: self.next_bucket_id,
                    logger: self.logger.as_deref_mut(),
                };
                child.delete_sub_bucket(&key)?;
            }
        }

        self.sub_buckets.remove(name);
        let _ = bucket_id;
        self.delete(name)
    }

    /// Walks every sub-bucket touched this transaction and writes its final
    /// root back into this bucket's tree as a bucket-flagged value, the way
    /// a normal `put` would, but marked `is_bucket_value`. Called once, at
    /// commit, after all nested mutation is done.
    pub fn flush_sub_buckets(&mut self) -> Result<(), Error> {
        let dirty: Vec<(Vec<u8>, PageId, BucketId)> = self
            .sub_buckets
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(name, e)| (name.clone(), e.root, e.bucket_id))
            .collect();
        for (name, root, bucket_id) in dirty {
            let mut tree = BTree::new(self.pager, self.cmp, self.txid);
            self.root = tree.insert_bucket_root(self.root, &name, root)?;
            if let Some(logger) = self.logger.as_deref_mut() {
                logger.sub_bucket(&name, bucket_id, root)?;
            }
            if let Some(entry) = self.sub_buckets.get_mut(&name) {
                entry.dirty = false;
            }
        }
        Ok(())
    }

    /// Collects every key/value pair in this bucket, in key order. A thin
    /// in-memory materialization rather than a lazy on-disk cursor --
    /// acceptable because ordinary B+Tree leaves are already singly linked
    /// only through the parent's slot array, and a from-scratch in-order
    /// walk is the simplest correct way to expose that order without
    /// maintaining leaf sibling pointers, which this format does not carry.
    pub fn iter(&self) -> Result<Cursor, PagerError> {
        let mut entries = Vec::new();
        self.collect_in_order(self.root, &mut entries)?;
        Ok(Cursor { entries, pos: 0 })
    }

    fn collect_in_order(&self, pgid: PageId, out: &mut Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), PagerError> {
        use super::node::{Node, NodeType};
        if pgid == PageId::INVALID {
            return Ok(());
        }
        let page = self.pager.reference(pgid)?;
        let node = Node::new(unsafe {
            std::slice::from_raw_parts_mut(page.as_ptr() as *mut u8, page.len())
        });
        match node.header().node_type {
            NodeType::Leaf => {
                for i in 0..node.count() {
                    if node.is_bucket_value(i) {
                        continue;
                    }
                    let key = node.key_at(i).to_vec();
                    let value = if let Some(v) = node.inline_value_at(i) {
                        v.to_vec()
                    } else {
                        let (first_page, total_len) = node.overflow_at(i).unwrap();
                        super::btree::read_overflow(self.pager, first_page, total_len)?
                    };
                    out.push((key, value));
                }
            }
            NodeType::Branch => {
                for i in 0..node.count() {
                    self.collect_in_order(node.child_at(i), out)?;
                }
                self.collect_in_order(node.tail_child(), out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileHandle;
    use crate::storage::node::lexicographic;
    use tempdir::TempDir;

    fn pager(page_size: u32) -> (Pager, TempDir) {
        let dir = TempDir::new("crucible-bucket").unwrap();
        let mut fh = FileHandle::open(&dir.path().join("data"), false).unwrap();
        fh.ensure_capacity(page_size as u64 * 4).unwrap();
        (Pager::new(fh, page_size, 2), dir)
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (mut pager, _dir) = pager(512);
        let mut next_id = 0u32;
        let mut bucket = Bucket::new(&mut pager, lexicographic, TxId(1), PageId::INVALID, &mut next_id, None);
        bucket.put(b"a", b"1").unwrap();
        bucket.put(b"b", b"2").unwrap();
        assert_eq!(bucket.get(b"a").unwrap(), Some(b"1".to_vec()));
        bucket.delete(b"a").unwrap();
        assert_eq!(bucket.get(b"a").unwrap(), None);
        assert_eq!(bucket.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn iter_returns_keys_in_order() {
        let (mut pager, _dir) = pager(512);
        let mut next_id = 0u32;
        let mut bucket = Bucket::new(&mut pager, lexicographic, TxId(1), PageId::INVALID, &mut next_id, None);
        bucket.put(b"c", b"3").unwrap();
        bucket.put(b"a", b"1").unwrap();
        bucket.put(b"b", b"2").unwrap();
        let mut cursor = bucket.iter().unwrap();
        let mut seen = Vec::new();
        while let Some((k, v)) = cursor.next() {
            seen.push((k.to_vec(), v.to_vec()));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn sub_bucket_is_materialized_lazily_and_flushed_on_commit() {
        let (mut pager, _dir) = pager(512);
        let mut next_id = 0u32;
        let mut bucket = Bucket::new(&mut pager, lexicographic, TxId(1), PageId::INVALID, &mut next_id, None);
        let _id = bucket.sub_bucket(b"inner").unwrap();
        {
            let mut inner = bucket.open_sub_bucket(b"inner").unwrap();
            inner.put(b"x", b"y").unwrap();
            let new_root = inner.root();
            bucket.close_sub_bucket(b"inner", new_root);
        }
        bucket.flush_sub_buckets().unwrap();

        let mut inner2 = bucket.open_sub_bucket(b"inner").unwrap();
        assert_eq!(inner2.get(b"x").unwrap(), Some(b"y".to_vec()));
    }
}
