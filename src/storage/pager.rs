//! The page allocator.
//!
//! Pages freed by a writer are not immediately reusable: a reader that began
//! before the free happened may still be walking the old path to them. Freed
//! runs are quarantined in `pending_map`, keyed by the committing
//! transaction's id, and only promoted into `free_map` once
//! [`Pager::release`] is told no view transaction older than that id remains
//! live. `free_map` is kept as an ordered, maximally-coalesced set of
//! `(PageId, PageCount)` runs, same invariant the teacher's allocator keeps
//! over its free page list, just backed by a `BTreeMap` instead of a
//! `VecDeque` so adjacent-run coalescing is a cheap `range` query instead of
//! a linear scan.
use std::collections::BTreeMap;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};

use super::error::PagerError;
use super::file::FileHandle;
use super::meta::{Meta, PageCount, PageId, TxId, META_PAGE_COUNT};

#[derive(Debug, Default, Clone, Copy)]
pub struct PagerStatistics {
    pub page_count: u32,
    pub free_page_count: u32,
    pub pending_page_count: u32,
    pub allocations: u64,
    pub frees: u64,
}

pub struct Pager {
    pub(crate) file: FileHandle,
    page_size: u32,
    page_count: u32,
    free_map: BTreeMap<PageId, PageCount>,
    pending_map: BTreeMap<TxId, Vec<(PageId, PageCount)>>,
    alloc_records: Vec<(PageId, PageCount)>,
    free_records: Vec<(PageId, PageCount)>,
    stats: PagerStatistics,
}

impl Pager {
    pub fn new(file: FileHandle, page_size: u32, page_count: u32) -> Self {
        Pager {
            file,
            page_size,
            page_count,
            free_map: BTreeMap::new(),
            pending_map: BTreeMap::new(),
            alloc_records: Vec::new(),
            free_records: Vec::new(),
            stats: PagerStatistics::default(),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn statistics(&self) -> PagerStatistics {
        let mut s = self.stats;
        s.page_count = self.page_count;
        s.free_page_count = self.free_map.values().map(|c| c.0).sum();
        s.pending_page_count = self
            .pending_map
            .values()
            .flat_map(|runs| runs.iter())
            .map(|(_, c)| c.0)
            .sum();
        s
    }

    /// Returns a read-only view of `pgid`.
    pub fn reference(&self, pgid: PageId) -> Result<&[u8], PagerError> {
        if pgid.0 >= self.page_count {
            return Err(PagerError::OutOfBounds(pgid));
        }
        let start = pgid.0 as usize * self.page_size as usize;
        Ok(&self.file.as_slice()[start..start + self.page_size as usize])
    }

    /// Returns a mutable view of `pgid`. Callers must only mutate pages they
    /// hold exclusively -- in practice, pages just returned by
    /// [`Pager::alloc`] or [`Pager::copy`] within the current write
    /// transaction.
    pub fn reference_mut(&mut self, pgid: PageId) -> Result<&mut [u8], PagerError> {
        if pgid.0 >= self.page_count {
            return Err(PagerError::OutOfBounds(pgid));
        }
        let page_size = self.page_size as usize;
        let start = pgid.0 as usize * page_size;
        Ok(&mut self.file.as_mut_slice()[start..start + page_size])
    }

    /// Allocates `count` contiguous fresh pages, preferring a run from the
    /// free list (first-fit) over growing the file.
    pub fn alloc(&mut self, count: u32) -> Result<PageId, PagerError> {
        if let Some((&pgid, &run_count)) = self.free_map.iter().find(|(_, c)| c.0 >= count) {
            self.free_map.remove(&pgid);
            if run_count.0 > count {
                self.free_map
                    .insert(pgid.next(count), PageCount(run_count.0 - count));
            }
            self.alloc_records.push((pgid, PageCount(count)));
            self.stats.allocations += 1;
            trace!("pager: allocated {:?}+{} from free list", pgid, count);
            return Ok(pgid);
        }

        let pgid = PageId(self.page_count);
        self.page_count += count;
        let min_len = self.page_count as u64 * self.page_size as u64;
        self.file
            .ensure_capacity(min_len)
            .map_err(|_| PagerError::AddressSpaceExhausted(min_len))?;
        self.alloc_records.push((pgid, PageCount(count)));
        self.stats.allocations += 1;
        trace!("pager: grew file, allocated {:?}+{}", pgid, count);
        Ok(pgid)
    }

    /// Copies the contents of `pgid` into a freshly allocated page and
    /// returns the new id. This is the core of the copy-on-write path: a
    /// node is never mutated in place once it is reachable from a durable
    /// meta page.
    pub fn copy(&mut self, pgid: PageId) -> Result<PageId, PagerError> {
        let new_pgid = self.alloc(1)?;
        let page_size = self.page_size as usize;
        let (src_start, dst_start) = (
            pgid.0 as usize * page_size,
            new_pgid.0 as usize * page_size,
        );
        let buf = self.file.as_mut_slice();
        let (src, dst) = if src_start < dst_start {
            let (a, b) = buf.split_at_mut(dst_start);
            (&a[src_start..src_start + page_size], &mut b[..page_size])
        } else {
            let (a, b) = buf.split_at_mut(src_start);
            (&b[..page_size], &mut a[dst_start..dst_start + page_size])
        };
        dst.copy_from_slice(src);
        Ok(new_pgid)
    }

    /// Marks `count` pages at `pgid` as no longer referenced by the
    /// transaction currently committing as `txid`. They are quarantined
    /// under `txid` until [`Pager::release`] confirms no reader older than
    /// `txid` remains.
    pub fn free(&mut self, pgid: PageId, count: u32, txid: TxId) {
        self.free_records.push((pgid, PageCount(count)));
        self.pending_map
            .entry(txid)
            .or_default()
            .push((pgid, PageCount(count)));
        self.stats.frees += 1;
    }

    /// Promotes every pending run committed strictly before `safe_txid` into
    /// the free list, coalescing adjacent runs. `safe_txid` is the oldest
    /// snapshot a live reader still holds, so a run quarantined at exactly
    /// `safe_txid` may still be reachable from that reader's view and must
    /// stay pending. Called by the transaction manager once it recomputes
    /// `min_view_txid` and finds it has advanced.
    pub fn release(&mut self, safe_txid: TxId) {
        let ready: Vec<TxId> = self.pending_map.range(..safe_txid).map(|(&t, _)| t).collect();
        for txid in ready {
            if let Some(runs) = self.pending_map.remove(&txid) {
                for (pgid, count) in runs {
                    self.insert_free_run(pgid, count);
                }
            }
        }
        debug!(
            "pager: released pending pages up to {:?}, free pages now {}",
            safe_txid,
            self.free_map.values().map(|c| c.0).sum::<u32>()
        );
    }

    fn insert_free_run(&mut self, pgid: PageId, count: PageCount) {
        let mut pgid = pgid;
        let mut count = count;

        // Merge with a preceding run that ends exactly at `pgid`.
        if let Some((&prev_pgid, &prev_count)) = self.free_map.range(..pgid).next_back() {
            if prev_pgid.next(prev_count.0) == pgid {
                self.free_map.remove(&prev_pgid);
                pgid = prev_pgid;
                count = PageCount(count.0 + prev_count.0);
            }
        }
        // Merge with a following run that starts exactly where this ends.
        let end = pgid.next(count.0);
        if let Some(&next_count) = self.free_map.get(&end) {
            self.free_map.remove(&end);
            count = PageCount(count.0 + next_count.0);
        }
        self.free_map.insert(pgid, count);
    }

    /// Discards every allocation recorded since the last commit, for an
    /// update transaction that is rolling back instead of committing.
    /// Allocated pages are returned to the free list; the transaction's
    /// frees are dropped along with its pending quarantine entry.
    pub fn rollback(&mut self, txid: TxId) {
        for (pgid, count) in self.alloc_records.drain(..) {
            self.insert_free_run(pgid, count);
        }
        self.pending_map.remove(&txid);
        self.free_records.clear();
        debug!("pager: rolled back allocations for {:?}", txid);
    }

    /// Clears the bookkeeping for a committed transaction: allocations stay
    /// allocated, and the frees recorded during the transaction have already
    /// been pushed into `pending_map` by [`Pager::free`].
    pub fn commit(&mut self) {
        self.alloc_records.clear();
        self.free_records.clear();
    }

    /// Serializes the free list onto pages allocated from the free list
    /// itself (the free list is its own first customer), writing the
    /// resulting head page id and pair/page counts into `meta`.
    pub fn save_free_list(&mut self, meta: &mut Meta) -> Result<(), PagerError> {
        let pairs: Vec<(PageId, PageCount)> = self.free_map.iter().map(|(&k, &v)| (k, v)).collect();
        let entry_len = 8usize; // PageId(4) + PageCount(4)
        let per_page = (self.page_size as usize - 4) / entry_len; // 4 bytes for next-page link

        if pairs.is_empty() {
            meta.free_list_pgid = PageId::INVALID;
            meta.free_pair_count = 0;
            meta.free_list_page_count = 0;
            return Ok(());
        }

        let pages_needed = pairs.len().div_ceil(per_page.max(1));
        let head = self.alloc(pages_needed as u32)?;
        for (i, chunk) in pairs.chunks(per_page.max(1)).enumerate() {
            let pgid = head.next(i as u32);
            let next = if i + 1 < pages_needed {
                pgid.next(1)
            } else {
                PageId::INVALID
            };
            let buf = self.reference_mut(pgid)?;
            (&mut buf[..4]).write_u32::<LittleEndian>(next.0).unwrap();
            let mut offset = 4;
            for (pgid, count) in chunk {
                (&mut buf[offset..offset + 4])
                    .write_u32::<LittleEndian>(pgid.0)
                    .unwrap();
                (&mut buf[offset + 4..offset + 8])
                    .write_u32::<LittleEndian>(count.0)
                    .unwrap();
                offset += entry_len;
            }
        }

        meta.free_list_pgid = head;
        meta.free_pair_count = pairs.len() as u32;
        meta.free_list_page_count = pages_needed as u32;
        Ok(())
    }

    /// Reads back a free list previously written by [`Pager::save_free_list`].
    pub fn load_free_list(&mut self, meta: &Meta) -> Result<(), PagerError> {
        self.free_map.clear();
        if meta.free_list_pgid == PageId::INVALID || meta.free_pair_count == 0 {
            return Ok(());
        }
        let entry_len = 8usize;
        let mut pgid = meta.free_list_pgid;
        let mut remaining = meta.free_pair_count as usize;
        loop {
            let buf = self.reference(pgid)?.to_vec();
            let next = PageId((&buf[..4]).read_u32::<LittleEndian>().unwrap());
            let mut offset = 4;
            while offset + entry_len <= buf.len() && remaining > 0 {
                let key = PageId((&buf[offset..offset + 4]).read_u32::<LittleEndian>().unwrap());
                let count = PageCount(
                    (&buf[offset + 4..offset + 8])
                        .read_u32::<LittleEndian>()
                        .unwrap(),
                );
                self.free_map.insert(key, count);
                offset += entry_len;
                remaining -= 1;
            }
            if remaining == 0 || next == PageId::INVALID {
                break;
            }
            pgid = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn pager(page_size: u32) -> (Pager, TempDir) {
        let dir = TempDir::new("crucible-pager").unwrap();
        let mut fh = FileHandle::open(&dir.path().join("data"), false).unwrap();
        fh.ensure_capacity(page_size as u64 * META_PAGE_COUNT as u64)
            .unwrap();
        (Pager::new(fh, page_size, META_PAGE_COUNT), dir)
    }

    #[test]
    fn alloc_grows_file_when_free_list_empty() {
        let (mut p, _dir) = pager(512);
        let pgid = p.alloc(1).unwrap();
        assert_eq!(pgid, PageId(META_PAGE_COUNT));
        assert_eq!(p.page_count(), META_PAGE_COUNT + 1);
    }

    #[test]
    fn free_then_release_makes_page_reusable() {
        let (mut p, _dir) = pager(512);
        let pgid = p.alloc(1).unwrap();
        p.commit();
        p.free(pgid, 1, TxId(1));
        p.release(TxId(2));
        let reused = p.alloc(1).unwrap();
        assert_eq!(reused, pgid);
    }

    #[test]
    fn release_respects_in_flight_readers() {
        let (mut p, _dir) = pager(512);
        let pgid = p.alloc(1).unwrap();
        p.commit();
        p.free(pgid, 1, TxId(5));
        p.release(TxId(4));
        let next = p.alloc(1).unwrap();
        assert_ne!(next, pgid);
    }

    #[test]
    fn rollback_returns_allocations_to_free_list() {
        let (mut p, _dir) = pager(512);
        let pgid = p.alloc(1).unwrap();
        p.rollback(TxId(1));
        let reused = p.alloc(1).unwrap();
        assert_eq!(reused, pgid);
    }

    #[test]
    fn adjacent_free_runs_coalesce() {
        let (mut p, _dir) = pager(512);
        let a = p.alloc(1).unwrap();
        let b = p.alloc(1).unwrap();
        p.commit();
        p.free(a, 1, TxId(1));
        p.free(b, 1, TxId(1));
        p.release(TxId(2));
        let run = p.alloc(2).unwrap();
        assert_eq!(run, a.min(b));
    }

    #[test]
    fn free_list_round_trips_through_meta() {
        let (mut p, dir) = pager(512);
        let a = p.alloc(1).unwrap();
        let b = p.alloc(1).unwrap();
        p.commit();
        p.free(a, 1, TxId(1));
        p.free(b, 1, TxId(1));
        p.release(TxId(2));

        let mut meta = Meta::new(512);
        p.save_free_list(&mut meta).unwrap();
        assert!(meta.free_pair_count >= 1);

        let mut p2 = Pager::new(
            FileHandle::open(&dir.path().join("data"), false).unwrap(),
            512,
            p.page_count(),
        );
        p2.load_free_list(&meta).unwrap();
        assert_eq!(p2.free_map.len(), p.free_map.len());
    }
}
