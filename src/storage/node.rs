//! On-disk layout of a single B+Tree page: a [`NodeHeader`], a sorted array
//! of fixed-size [`Slot`]s growing forward from the header, and a record data
//! area growing backward from the end of the page. This is the same
//! two-region-per-page shape as the teacher's `TwoArrayTrailer`/`Page`
//! layout, generalized from a sorted `Vec<Row>` to a slotted, binary-search
//! page so it can support copy-on-write splits and overflow records.
use std::cmp::Ordering;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::meta::{PageId, SlotId};

/// A key comparison function. Built-ins are provided below; callers may
/// supply any `fn` pointer with this signature through [`Options`](super::options::Options).
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

pub fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

pub fn u32_be(a: &[u8], b: &[u8]) -> Ordering {
    u32::from_be_bytes(a.try_into().expect("4-byte key")).cmp(&u32::from_be_bytes(
        b.try_into().expect("4-byte key"),
    ))
}

pub fn u64_be(a: &[u8], b: &[u8]) -> Ordering {
    u64::from_be_bytes(a.try_into().expect("8-byte key")).cmp(&u64::from_be_bytes(
        b.try_into().expect("8-byte key"),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Branch,
}

/// A value stored beyond the half-page overflow threshold is split out of
/// the node's record area and stored as a chain of raw overflow pages.
/// `OVERFLOW_RATIO` mirrors the "about half a page" threshold spec'd for
/// when a record must be pushed out of line.
pub const OVERFLOW_RATIO: f64 = 0.5;

pub const HEADER_LEN: usize = 8 + 1 + 2 + 2 + 2 + 4; // see NodeHeader::encode
pub const SLOT_LEN: usize = 12;

/// Fixed per-page header. `tail_child` is only meaningful for branch nodes:
/// it is the rightmost child, covering keys greater than or equal to the
/// last slot's key (branch nodes have one more child than they have keys).
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub last_modified_txid: u64,
    pub node_type: NodeType,
    pub count: u16,
    pub space_used: u16,
    pub data_offset: u16,
    pub tail_child: PageId,
}

impl NodeHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        let mut w = &mut buf[..HEADER_LEN];
        w.write_u64::<LittleEndian>(self.last_modified_txid).unwrap();
        w.write_u8(match self.node_type {
            NodeType::Leaf => 0,
            NodeType::Branch => 1,
        })
        .unwrap();
        w.write_u16::<LittleEndian>(self.count).unwrap();
        w.write_u16::<LittleEndian>(self.space_used).unwrap();
        w.write_u16::<LittleEndian>(self.data_offset).unwrap();
        w.write_u32::<LittleEndian>(self.tail_child.0).unwrap();
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut r = &buf[..HEADER_LEN];
        let last_modified_txid = r.read_u64::<LittleEndian>().unwrap();
        let node_type = match r.read_u8().unwrap() {
            0 => NodeType::Leaf,
            _ => NodeType::Branch,
        };
        let count = r.read_u16::<LittleEndian>().unwrap();
        let space_used = r.read_u16::<LittleEndian>().unwrap();
        let data_offset = r.read_u16::<LittleEndian>().unwrap();
        let tail_child = PageId(r.read_u32::<LittleEndian>().unwrap());
        NodeHeader {
            last_modified_txid,
            node_type,
            count,
            space_used,
            data_offset,
            tail_child,
        }
    }
}

/// A single fixed-size (12-byte) slot entry. The record-area interpretation
/// varies (inline vs. overflow, leaf-value vs. branch-child), but the slot
/// itself is always this shape, so binary search never needs to know what
/// kind of record a slot points at.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub record_offset: u32,
    pub key_length: u16,
    pub is_overflow: bool,
    pub is_bucket_value: bool,
    pub value_or_left_child: u32,
}

impl Slot {
    fn encode(&self, buf: &mut [u8]) {
        let mut w = &mut buf[..SLOT_LEN];
        w.write_u32::<LittleEndian>(self.record_offset).unwrap();
        w.write_u16::<LittleEndian>(self.key_length).unwrap();
        let mut flags = 0u8;
        if self.is_overflow {
            flags |= 0b01;
        }
        if self.is_bucket_value {
            flags |= 0b10;
        }
        w.write_u8(flags).unwrap();
        w.write_u8(0).unwrap();
        w.write_u32::<LittleEndian>(self.value_or_left_child)
            .unwrap();
    }

    fn decode(buf: &[u8]) -> Self {
        let mut r = &buf[..SLOT_LEN];
        let record_offset = r.read_u32::<LittleEndian>().unwrap();
        let key_length = r.read_u16::<LittleEndian>().unwrap();
        let flags = r.read_u8().unwrap();
        let _pad = r.read_u8().unwrap();
        let value_or_left_child = r.read_u32::<LittleEndian>().unwrap();
        Slot {
            record_offset,
            key_length,
            is_overflow: flags & 0b01 != 0,
            is_bucket_value: flags & 0b10 != 0,
            value_or_left_child,
        }
    }
}

/// A typed view over a page's raw bytes.
///
/// The slot array starts right after [`HEADER_LEN`] and grows forward; the
/// record data area starts at `page.len()` and grows backward, with
/// `header.data_offset` tracking the current low-water mark. Free space is
/// whatever lies between the end of the slot array and `data_offset`.
pub struct Node<'a> {
    buf: &'a mut [u8],
}

#[derive(Debug, Clone, Copy)]
pub enum ValueRef {
    Inline,
    Overflow { first_page: PageId, total_len: u32 },
}

impl<'a> Node<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Node { buf }
    }

    pub fn init(buf: &mut [u8], node_type: NodeType, txid: u64) {
        let header = NodeHeader {
            last_modified_txid: txid,
            node_type,
            count: 0,
            space_used: 0,
            data_offset: buf.len() as u16,
            tail_child: PageId::INVALID,
        };
        header.encode(buf);
    }

    pub fn header(&self) -> NodeHeader {
        NodeHeader::decode(self.buf)
    }

    fn set_header(&mut self, h: &NodeHeader) {
        h.encode(self.buf);
    }

    pub fn node_type(&self) -> NodeType {
        self.header().node_type
    }

    pub fn count(&self) -> usize {
        self.header().count as usize
    }

    fn slot_offset(index: usize) -> usize {
        HEADER_LEN + index * SLOT_LEN
    }

    fn slot(&self, index: usize) -> Slot {
        let off = Self::slot_offset(index);
        Slot::decode(&self.buf[off..off + SLOT_LEN])
    }

    fn set_slot(&mut self, index: usize, slot: &Slot) {
        let off = Self::slot_offset(index);
        slot.encode(&mut self.buf[off..off + SLOT_LEN]);
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let slot = self.slot(index);
        let start = slot.record_offset as usize;
        &self.buf[start..start + slot.key_length as usize]
    }

    /// For a leaf slot: the raw inline value bytes, or `None` if the value
    /// lives out of line (overflow).
    pub fn inline_value_at(&self, index: usize) -> Option<&[u8]> {
        let slot = self.slot(index);
        if slot.is_overflow {
            return None;
        }
        let key_start = slot.record_offset as usize;
        let value_len_start = key_start + slot.key_length as usize;
        let value_len = u32::from_le_bytes(
            self.buf[value_len_start..value_len_start + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        let value_start = value_len_start + 4;
        Some(&self.buf[value_start..value_start + value_len])
    }

    pub fn overflow_at(&self, index: usize) -> Option<(PageId, u32)> {
        let slot = self.slot(index);
        if !slot.is_overflow {
            return None;
        }
        let key_start = slot.record_offset as usize;
        let body_start = key_start + slot.key_length as usize;
        let total_len =
            u32::from_le_bytes(self.buf[body_start..body_start + 4].try_into().unwrap());
        let first_page = PageId(u32::from_le_bytes(
            self.buf[body_start + 4..body_start + 8].try_into().unwrap(),
        ));
        Some((first_page, total_len))
    }

    pub fn is_bucket_value(&self, index: usize) -> bool {
        self.slot(index).is_bucket_value
    }

    /// Child page for keys less than `key_at(index)` (branch nodes only).
    pub fn child_at(&self, index: usize) -> PageId {
        PageId(self.slot(index).value_or_left_child)
    }

    pub fn tail_child(&self) -> PageId {
        self.header().tail_child
    }

    pub fn set_tail_child(&mut self, pgid: PageId) {
        let mut h = self.header();
        h.tail_child = pgid;
        self.set_header(&h);
    }

    pub fn set_child_at(&mut self, index: usize, pgid: PageId) {
        let mut s = self.slot(index);
        s.value_or_left_child = pgid.0;
        self.set_slot(index, &s);
    }

    /// Drops every slot from `new_count` onward. The record bytes they
    /// pointed at become unreachable garbage in this page's data area;
    /// harmless here because callers only truncate pages that were just
    /// copy-on-write cloned for a split and never directly reused.
    pub fn truncate(&mut self, new_count: usize, txid: u64) {
        let mut h = self.header();
        h.count = new_count as u16;
        h.last_modified_txid = txid;
        self.set_header(&h);
    }

    /// Binary search for `key`. `Ok(i)` means an exact match at slot `i`;
    /// `Err(i)` means `key` would sort at position `i`.
    pub fn lower_bound(&self, key: &[u8], cmp: Comparator) -> Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(self.key_at(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn free_space(&self) -> usize {
        let h = self.header();
        let slots_end = Self::slot_offset(h.count as usize);
        (h.data_offset as usize).saturating_sub(slots_end)
    }

    pub fn fits(&self, record_len: usize) -> bool {
        self.free_space() >= SLOT_LEN + record_len
    }

    pub fn get_fill_rate(&self) -> f64 {
        let h = self.header();
        let used = Self::slot_offset(h.count as usize) + (self.buf.len() - h.data_offset as usize);
        used as f64 / self.buf.len() as f64
    }

    /// Inserts an inline leaf record (key + value) at `index`, shifting
    /// later slots up. Callers must have already verified [`Node::fits`]
    /// and decided overflow vs. inline via [`OVERFLOW_RATIO`].
    pub fn insert_inline(
        &mut self,
        index: usize,
        key: &[u8],
        value: &[u8],
        is_bucket_value: bool,
        txid: u64,
    ) {
        let record_len = key.len() + 4 + value.len();
        let mut h = self.header();
        let new_offset = h.data_offset as usize - record_len;
        {
            let body = &mut self.buf[new_offset..new_offset + record_len];
            body[..key.len()].copy_from_slice(key);
            body[key.len()..key.len() + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
            body[key.len() + 4..].copy_from_slice(value);
        }
        self.shift_slots_up(index, h.count as usize);
        self.set_slot(
            index,
            &Slot {
                record_offset: new_offset as u32,
                key_length: key.len() as u16,
                is_overflow: false,
                is_bucket_value,
                value_or_left_child: 0,
            },
        );
        h.count += 1;
        h.data_offset = new_offset as u16;
        h.space_used += (record_len + SLOT_LEN) as u16;
        h.last_modified_txid = txid;
        self.set_header(&h);
    }

    /// Inserts a leaf record whose value lives on overflow pages.
    pub fn insert_overflow(
        &mut self,
        index: usize,
        key: &[u8],
        first_page: PageId,
        total_len: u32,
        is_bucket_value: bool,
        txid: u64,
    ) {
        let record_len = key.len() + 8;
        let mut h = self.header();
        let new_offset = h.data_offset as usize - record_len;
        {
            let body = &mut self.buf[new_offset..new_offset + record_len];
            body[..key.len()].copy_from_slice(key);
            body[key.len()..key.len() + 4].copy_from_slice(&total_len.to_le_bytes());
            body[key.len() + 4..key.len() + 8].copy_from_slice(&first_page.0.to_le_bytes());
        }
        self.shift_slots_up(index, h.count as usize);
        self.set_slot(
            index,
            &Slot {
                record_offset: new_offset as u32,
                key_length: key.len() as u16,
                is_overflow: true,
                is_bucket_value,
                value_or_left_child: 0,
            },
        );
        h.count += 1;
        h.data_offset = new_offset as u16;
        h.space_used += (record_len + SLOT_LEN) as u16;
        h.last_modified_txid = txid;
        self.set_header(&h);
    }

    /// Inserts a branch key with its left child at `index`.
    pub fn insert_branch(&mut self, index: usize, key: &[u8], left_child: PageId, txid: u64) {
        let mut h = self.header();
        let new_offset = h.data_offset as usize - key.len();
        self.buf[new_offset..new_offset + key.len()].copy_from_slice(key);
        self.shift_slots_up(index, h.count as usize);
        self.set_slot(
            index,
            &Slot {
                record_offset: new_offset as u32,
                key_length: key.len() as u16,
                is_overflow: false,
                is_bucket_value: false,
                value_or_left_child: left_child.0,
            },
        );
        h.count += 1;
        h.data_offset = new_offset as u16;
        h.space_used += (key.len() + SLOT_LEN) as u16;
        h.last_modified_txid = txid;
        self.set_header(&h);
    }

    fn shift_slots_up(&mut self, index: usize, count: usize) {
        for i in (index..count).rev() {
            let s = self.slot(i);
            self.set_slot(i + 1, &s);
        }
    }

    pub fn delete(&mut self, index: usize, txid: u64) {
        let mut h = self.header();
        for i in index..h.count as usize - 1 {
            let s = self.slot(i + 1);
            self.set_slot(i, &s);
        }
        h.count -= 1;
        h.last_modified_txid = txid;
        self.set_header(&h);
        // Reclaimed record-area bytes are reclaimed lazily by compactify;
        // leaving a hole here keeps delete O(count) instead of O(page size).
    }

    /// Rebuilds the record area with no holes, packing records tightly
    /// against the end of the page in slot order. Called before a page is
    /// persisted when fragmentation from deletes/updates could otherwise
    /// make `fits` pessimistic.
    pub fn compactify(&mut self, txid: u64) {
        let h = self.header();
        let count = h.count as usize;
        let mut records: Vec<Vec<u8>> = Vec::with_capacity(count);
        let mut slots: Vec<Slot> = Vec::with_capacity(count);
        for i in 0..count {
            let s = self.slot(i);
            let record_len = if s.is_overflow {
                s.key_length as usize + 8
            } else if h.node_type == NodeType::Leaf {
                let key_start = s.record_offset as usize;
                let value_len_start = key_start + s.key_length as usize;
                let value_len = u32::from_le_bytes(
                    self.buf[value_len_start..value_len_start + 4]
                        .try_into()
                        .unwrap(),
                ) as usize;
                s.key_length as usize + 4 + value_len
            } else {
                s.key_length as usize
            };
            records.push(self.buf[s.record_offset as usize..s.record_offset as usize + record_len].to_vec());
            slots.push(s);
        }

        let mut offset = self.buf.len();
        for (i, record) in records.iter().enumerate() {
            offset -= record.len();
            self.buf[offset..offset + record.len()].copy_from_slice(record);
            slots[i].record_offset = offset as u32;
        }
        for (i, s) in slots.iter().enumerate() {
            self.set_slot(i, s);
        }
        let mut h = h;
        h.data_offset = offset as u16;
        h.last_modified_txid = txid;
        self.set_header(&h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_leaf(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        Node::init(&mut buf, NodeType::Leaf, 1);
        buf
    }

    #[test]
    fn insert_and_read_back_inline() {
        let mut buf = new_leaf(512);
        let mut node = Node::new(&mut buf);
        node.insert_inline(0, b"a", b"1", false, 1);
        node.insert_inline(1, b"b", b"2", false, 1);
        assert_eq!(node.count(), 2);
        assert_eq!(node.key_at(0), b"a");
        assert_eq!(node.inline_value_at(0), Some(&b"1"[..]));
        assert_eq!(node.key_at(1), b"b");
        assert_eq!(node.inline_value_at(1), Some(&b"2"[..]));
    }

    #[test]
    fn lower_bound_finds_insertion_point() {
        let mut buf = new_leaf(512);
        let mut node = Node::new(&mut buf);
        node.insert_inline(0, b"b", b"1", false, 1);
        node.insert_inline(1, b"d", b"1", false, 1);
        assert_eq!(node.lower_bound(b"a", lexicographic), Err(0));
        assert_eq!(node.lower_bound(b"b", lexicographic), Ok(0));
        assert_eq!(node.lower_bound(b"c", lexicographic), Err(1));
        assert_eq!(node.lower_bound(b"e", lexicographic), Err(2));
    }

    #[test]
    fn delete_shifts_remaining_slots() {
        let mut buf = new_leaf(512);
        let mut node = Node::new(&mut buf);
        node.insert_inline(0, b"a", b"1", false, 1);
        node.insert_inline(1, b"b", b"2", false, 1);
        node.insert_inline(2, b"c", b"3", false, 1);
        node.delete(1, 2);
        assert_eq!(node.count(), 2);
        assert_eq!(node.key_at(0), b"a");
        assert_eq!(node.key_at(1), b"c");
    }

    #[test]
    fn compactify_preserves_contents() {
        let mut buf = new_leaf(512);
        let mut node = Node::new(&mut buf);
        node.insert_inline(0, b"a", b"11", false, 1);
        node.insert_inline(1, b"b", b"22", false, 1);
        node.delete(0, 2);
        node.compactify(3);
        assert_eq!(node.count(), 1);
        assert_eq!(node.key_at(0), b"b");
        assert_eq!(node.inline_value_at(0), Some(&b"22"[..]));
    }

    #[test]
    fn branch_insert_tracks_children() {
        let mut buf = vec![0u8; 512];
        Node::init(&mut buf, NodeType::Branch, 1);
        let mut node = Node::new(&mut buf);
        node.insert_branch(0, b"m", PageId(10), 1);
        node.set_tail_child(PageId(11));
        assert_eq!(node.child_at(0), PageId(10));
        assert_eq!(node.tail_child(), PageId(11));
    }
}
