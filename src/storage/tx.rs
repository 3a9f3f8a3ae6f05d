//! Transactions and the transaction manager.
//!
//! One update transaction may be open at a time; any number of view
//! transactions may be open concurrently with it and with each other. A view
//! transaction pins the meta (and therefore the page graph) it opened
//! against, so its reads never observe a partially applied commit and its
//! presence holds back page reclamation for anything still reachable from
//! that meta.
use std::collections::BTreeMap;

use log::{debug, info};

use super::bucket::Bucket;
use super::error::TxManagerError;
use super::meta::{Meta, PageId, TxId};
use super::node::Comparator;
use super::pager::Pager;
use super::wal::Logger;

/// Tracks live view transactions and the single live update transaction (if
/// any), and derives `min_view_txid`: the oldest snapshot any reader still
/// holds, which bounds how far the pager may advance page reclamation.
pub struct TxManager {
    /// Refcount per still-open view txid (more than one view tx can share a
    /// snapshot if they started between the same two commits).
    view_tx_map: BTreeMap<TxId, usize>,
    /// The highest txid that has been durably committed and checkpointed.
    persisted_txid: TxId,
    writer_active: bool,
}

impl TxManager {
    pub fn new(persisted_txid: TxId) -> Self {
        TxManager {
            view_tx_map: BTreeMap::new(),
            persisted_txid,
            writer_active: false,
        }
    }

    /// The oldest snapshot still held by a live reader, or `persisted_txid`
    /// if there are no readers: the floor below which the pager may safely
    /// reclaim pages.
    pub fn min_view_txid(&self) -> TxId {
        self.view_tx_map
            .keys()
            .next()
            .copied()
            .unwrap_or(self.persisted_txid)
    }

    pub fn begin_view(&mut self, txid: TxId) {
        *self.view_tx_map.entry(txid).or_insert(0) += 1;
    }

    pub fn end_view(&mut self, txid: TxId) {
        if let Some(count) = self.view_tx_map.get_mut(&txid) {
            *count -= 1;
            if *count == 0 {
                self.view_tx_map.remove(&txid);
            }
        }
    }

    pub fn begin_update(&mut self) -> Result<(), TxManagerError> {
        if self.writer_active {
            return Err(TxManagerError::WriterBusy);
        }
        self.writer_active = true;
        Ok(())
    }

    pub fn commit_update(&mut self, txid: TxId) {
        self.writer_active = false;
        self.persisted_txid = txid;
        info!("tx manager: committed {:?}", txid);
    }

    pub fn rollback_update(&mut self) {
        self.writer_active = false;
        debug!("tx manager: rolled back the active update transaction");
    }

    pub fn is_writer_active(&self) -> bool {
        self.writer_active
    }

    pub fn view_tx_count(&self) -> usize {
        self.view_tx_map.values().sum()
    }
}

/// A read-only snapshot transaction. Holds the meta it was opened against
/// fixed for its whole lifetime; every [`Bucket`] it opens reads through
/// that frozen page graph.
pub struct ViewTx<'a> {
    pager: &'a Pager,
    cmp: Comparator,
    meta: Meta,
    next_bucket_id: u32,
}

impl<'a> ViewTx<'a> {
    pub fn new(pager: &'a Pager, cmp: Comparator, meta: Meta) -> Self {
        ViewTx { pager, cmp, meta, next_bucket_id: 0 }
    }

    pub fn txid(&self) -> TxId {
        self.meta.txid
    }

    /// Opens the top-level (unnamed) bucket read-only.
    pub fn user_bucket(&mut self) -> Bucket<'_> {
        // Safety of the `&self.pager` -> `&mut Pager` cast below: `Bucket`'s
        // write paths (`put`/`delete`/`sub_bucket` materialization writes)
        // are simply never called by a caller holding a `ViewTx`, since this
        // type has no API that would let them. `Bucket::get`/`iter` only
        // read through the pager reference they hold.
        let pager = unsafe { &mut *(self.pager as *const Pager as *mut Pager) };
        Bucket::new(pager, self.cmp, self.meta.txid, self.meta.user_root, &mut self.next_bucket_id, None)
    }
}

/// A read/write transaction. At most one may be open at a time; dropping it
/// without calling [`UpdateTx::commit`] is a rollback.
pub struct UpdateTx<'a> {
    pager: &'a mut Pager,
    cmp: Comparator,
    txid: TxId,
    root: PageId,
    next_bucket_id: u32,
    finished: bool,
    logger: &'a mut Logger,
}

impl<'a> UpdateTx<'a> {
    pub fn new(pager: &'a mut Pager, cmp: Comparator, txid: TxId, root: PageId, logger: &'a mut Logger) -> Self {
        UpdateTx {
            pager,
            cmp,
            txid,
            root,
            next_bucket_id: 0,
            finished: false,
            logger,
        }
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn user_bucket(&mut self) -> Bucket<'_> {
        Bucket::new(
            self.pager,
            self.cmp,
            self.txid,
            self.root,
            &mut self.next_bucket_id,
            Some(&mut *self.logger),
        )
    }

    /// Flushes the bucket's root back into the transaction so a subsequent
    /// `user_bucket()` call (or `commit`) sees the mutation.
    pub fn apply(&mut self, new_root: PageId) {
        self.root = new_root;
    }

    pub fn finish(mut self) -> TxId {
        self.finished = true;
        self.txid
    }
}

impl Drop for UpdateTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pager.rollback(self.txid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_view_txid_is_persisted_when_no_readers() {
        let mgr = TxManager::new(TxId(5));
        assert_eq!(mgr.min_view_txid(), TxId(5));
    }

    #[test]
    fn min_view_txid_tracks_oldest_reader() {
        let mut mgr = TxManager::new(TxId(0));
        mgr.begin_view(TxId(3));
        mgr.begin_view(TxId(7));
        assert_eq!(mgr.min_view_txid(), TxId(3));
        mgr.end_view(TxId(3));
        assert_eq!(mgr.min_view_txid(), TxId(7));
    }

    #[test]
    fn only_one_writer_at_a_time() {
        let mut mgr = TxManager::new(TxId(0));
        mgr.begin_update().unwrap();
        assert!(matches!(mgr.begin_update(), Err(TxManagerError::WriterBusy)));
        mgr.commit_update(TxId(1));
        assert!(mgr.begin_update().is_ok());
    }

    #[test]
    fn shared_snapshot_refcounts_correctly() {
        let mut mgr = TxManager::new(TxId(0));
        mgr.begin_view(TxId(4));
        mgr.begin_view(TxId(4));
        mgr.end_view(TxId(4));
        assert_eq!(mgr.min_view_txid(), TxId(4));
        mgr.end_view(TxId(4));
        assert_eq!(mgr.min_view_txid(), TxId(0));
    }
}
