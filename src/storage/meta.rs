//! Identifiers and the two alternating superblocks ("meta pages") that anchor
//! the database file.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::error::MetaError;

/// Identifies a single fixed-size page in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

/// Identifies a transaction by its monotonically increasing sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub u64);

/// Identifies a bucket (a named, independently rooted B+Tree) within the
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketId(pub u32);

/// Identifies a slot's position within a node's sorted slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u16);

/// Number of contiguous pages in a free-list run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCount(pub u32);

impl PageId {
    pub const INVALID: PageId = PageId(u32::MAX);

    pub fn next(self, count: u32) -> PageId {
        PageId(self.0 + count)
    }
}

/// Database signature, stored in every meta page.
pub const SIGN: u32 = 0x4352_4233; // "CRB3"
pub const MIN_VERSION: u32 = 1;

/// Minimum allowed page size, per the on-disk format contract.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Number of meta pages kept at the head of the file, alternately updated so
/// that a crash mid-write never destroys the last durable meta page.
pub const META_PAGE_COUNT: u32 = 2;

/// The on-disk byte length of an encoded [`Meta`] (before page padding).
pub const META_ENCODED_LEN: usize = 4 + 4 + 4 + 4 + 4 + 8 + 4 + 4 + 4 + 4;

/// A database superblock.
///
/// Two copies are kept (at page 0 and page 1); whichever has a valid
/// signature, a supported version, a matching checksum, and the higher
/// `txid` is the database's current meta at open time. Commits always write
/// the *other* copy, then durably flush it, before any reader can observe it
/// -- that ordering is what makes a crash mid-checkpoint recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub sign: u32,
    pub min_version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub user_root: PageId,
    pub txid: TxId,
    pub free_list_pgid: PageId,
    pub free_pair_count: u32,
    pub free_list_page_count: u32,
}

impl Meta {
    pub fn new(page_size: u32) -> Self {
        Meta {
            sign: SIGN,
            min_version: MIN_VERSION,
            page_size,
            page_count: META_PAGE_COUNT,
            user_root: PageId::INVALID,
            txid: TxId(0),
            free_list_pgid: PageId::INVALID,
            free_pair_count: 0,
            free_list_page_count: 0,
        }
    }

    /// Encodes this meta into `buf`, appending a trailing CRC32 over every
    /// preceding field. `buf` must have at least [`META_ENCODED_LEN`] bytes
    /// of capacity.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= META_ENCODED_LEN);
        let mut w = &mut buf[..META_ENCODED_LEN - 4];
        w.write_u32::<LittleEndian>(self.sign).unwrap();
        w.write_u32::<LittleEndian>(self.min_version).unwrap();
        w.write_u32::<LittleEndian>(self.page_size).unwrap();
        w.write_u32::<LittleEndian>(self.page_count).unwrap();
        w.write_u32::<LittleEndian>(self.user_root.0).unwrap();
        w.write_u64::<LittleEndian>(self.txid.0).unwrap();
        w.write_u32::<LittleEndian>(self.free_list_pgid.0).unwrap();
        w.write_u32::<LittleEndian>(self.free_pair_count).unwrap();
        w.write_u32::<LittleEndian>(self.free_list_page_count)
            .unwrap();
        let crc = crc32fast::hash(&buf[..META_ENCODED_LEN - 4]);
        (&mut buf[META_ENCODED_LEN - 4..META_ENCODED_LEN])
            .write_u32::<LittleEndian>(crc)
            .unwrap();
    }

    /// Decodes and validates a meta page, checking signature, version, and
    /// checksum. Returns an error describing exactly what failed so the
    /// caller can decide whether to fall back to the other copy.
    pub fn decode(buf: &[u8]) -> Result<Self, MetaError> {
        assert!(buf.len() >= META_ENCODED_LEN);
        let stored_crc = (&buf[META_ENCODED_LEN - 4..META_ENCODED_LEN])
            .read_u32::<LittleEndian>()
            .unwrap();
        let computed_crc = crc32fast::hash(&buf[..META_ENCODED_LEN - 4]);
        if stored_crc != computed_crc {
            return Err(MetaError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let mut r = &buf[..META_ENCODED_LEN - 4];
        let sign = r.read_u32::<LittleEndian>().unwrap();
        if sign != SIGN {
            return Err(MetaError::BadSignature {
                expected: SIGN,
                found: sign,
            });
        }
        let min_version = r.read_u32::<LittleEndian>().unwrap();
        if min_version > MIN_VERSION {
            return Err(MetaError::UnsupportedVersion {
                found: min_version,
                min: MIN_VERSION,
            });
        }
        let page_size = r.read_u32::<LittleEndian>().unwrap();
        let page_count = r.read_u32::<LittleEndian>().unwrap();
        let user_root = PageId(r.read_u32::<LittleEndian>().unwrap());
        let txid = TxId(r.read_u64::<LittleEndian>().unwrap());
        let free_list_pgid = PageId(r.read_u32::<LittleEndian>().unwrap());
        let free_pair_count = r.read_u32::<LittleEndian>().unwrap();
        let free_list_page_count = r.read_u32::<LittleEndian>().unwrap();

        Ok(Meta {
            sign,
            min_version,
            page_size,
            page_count,
            user_root,
            txid,
            free_list_pgid,
            free_pair_count,
            free_list_page_count,
        })
    }

    /// Picks the current meta out of the two on-disk copies: the one that
    /// decodes successfully with the higher `txid` wins. Both copies failing
    /// to decode is unrecoverable.
    pub fn choose_current(a: &[u8], b: &[u8]) -> Result<(Meta, bool), MetaError> {
        let da = Meta::decode(a);
        let db = Meta::decode(b);
        match (da, db) {
            (Ok(ma), Ok(mb)) => {
                if mb.txid > ma.txid {
                    Ok((mb, true))
                } else {
                    Ok((ma, false))
                }
            }
            (Ok(ma), Err(_)) => Ok((ma, false)),
            (Err(_), Ok(mb)) => Ok((mb, true)),
            (Err(_), Err(_)) => Err(MetaError::NoValidMeta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips() {
        let mut m = Meta::new(4096);
        m.user_root = PageId(7);
        m.txid = TxId(42);
        m.free_list_pgid = PageId(2);
        m.free_pair_count = 3;
        m.free_list_page_count = 1;

        let mut buf = [0u8; META_ENCODED_LEN];
        m.encode(&mut buf);
        let decoded = Meta::decode(&buf).expect("valid meta");
        assert_eq!(decoded, m);
    }

    #[test]
    fn meta_detects_checksum_corruption() {
        let m = Meta::new(4096);
        let mut buf = [0u8; META_ENCODED_LEN];
        m.encode(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            Meta::decode(&buf),
            Err(MetaError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn choose_current_prefers_higher_txid() {
        let mut m0 = Meta::new(4096);
        m0.txid = TxId(5);
        let mut m1 = Meta::new(4096);
        m1.txid = TxId(6);

        let mut buf0 = [0u8; META_ENCODED_LEN];
        let mut buf1 = [0u8; META_ENCODED_LEN];
        m0.encode(&mut buf0);
        m1.encode(&mut buf1);

        let (chosen, is_b) = Meta::choose_current(&buf0, &buf1).unwrap();
        assert_eq!(chosen.txid, TxId(6));
        assert!(is_b);
    }

    #[test]
    fn choose_current_falls_back_to_valid_copy() {
        let mut m0 = Meta::new(4096);
        m0.txid = TxId(5);
        let mut buf0 = [0u8; META_ENCODED_LEN];
        m0.encode(&mut buf0);
        let buf1 = [0u8; META_ENCODED_LEN];

        let (chosen, is_b) = Meta::choose_current(&buf0, &buf1).unwrap();
        assert_eq!(chosen.txid, TxId(5));
        assert!(!is_b);
    }
}
