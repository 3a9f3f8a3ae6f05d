//! The `<path>-wal` write-ahead log: physical 32 KiB block framing around
//! logical transaction records, plus the recovery and checkpoint protocols
//! built on top of it.
//!
//! Physical framing follows the teacher's choice of binding logical records
//! into a length-prefixed, checksummed on-disk shape (`Logger`/`LogEntry` in
//! `storage/log.rs`), generalized here into fixed 32 KiB blocks carrying
//! `Full`/`First`/`Middle`/`Last`/`Zero` record fragments so a logical
//! record may span block boundaries without ever crossing a checksum
//! boundary uncovered. Logical entries are still bincode-encoded structs,
//! exactly as the teacher's `LogEntry` is, via `#[derive(Encode, Decode)]`.
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use super::error::LoggerError;
use super::meta::{BucketId, PageId, TxId};

pub const BLOCK_SIZE: usize = 32 * 1024;
/// checksum(4) + size(2) + type(1)
const FRAME_HEADER_LEN: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FrameType::Zero,
            1 => FrameType::Full,
            2 => FrameType::First,
            3 => FrameType::Middle,
            4 => FrameType::Last,
            _ => return None,
        })
    }
}

/// A logical WAL entry. `WalTxId` always precedes the first entry of a
/// transaction's record run so a reader doesn't need to have seen `Begin`
/// to know which transaction subsequent entries belong to.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum LogEntry {
    WalTxId(u64),
    Begin,
    Rollback,
    Commit,
    SubBucket { name: Vec<u8>, bucket_id: u32, root: u32 },
    Put { key: Vec<u8>, value: Vec<u8>, is_bucket: bool },
    Delete { key: Vec<u8> },
}

/// Appends logical entries to the WAL, framing each encoded entry into one
/// or more physical blocks.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    block_pos: usize,
    len: u64,
}

impl WalWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        let block_pos = (len as usize) % BLOCK_SIZE;
        Ok(WalWriter {
            file,
            path: path.to_path_buf(),
            block_pos,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn write_frame(&mut self, frame_type: FrameType, bytes: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len());
        let checksum = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[frame_type as u8]);
            hasher.update(bytes);
            hasher.finalize()
        };
        frame.write_u32::<LittleEndian>(checksum)?;
        frame.write_u16::<LittleEndian>(bytes.len() as u16)?;
        frame.write_u8(frame_type as u8)?;
        frame.extend_from_slice(bytes);

        self.file.write_all(&frame)?;
        self.len += frame.len() as u64;
        self.block_pos += frame.len();
        if self.block_pos >= BLOCK_SIZE {
            self.block_pos %= BLOCK_SIZE;
        }
        Ok(())
    }

    /// Appends one logical entry, splitting it across as many physical
    /// blocks as needed. Pads the remainder of the current block with a
    /// `Zero` frame first if there isn't room for at least a frame header,
    /// matching the classic "never let a frame header straddle a block"
    /// rule this block layout depends on.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), LoggerError> {
        let payload = bincode::encode_to_vec(entry, bincode::config::standard())
            .expect("LogEntry encoding cannot fail");

        let remaining_in_block = BLOCK_SIZE - self.block_pos;
        if remaining_in_block < FRAME_HEADER_LEN {
            let pad = vec![0u8; remaining_in_block];
            self.file
                .write_all(&pad)
                .map_err(|_| LoggerError::Truncated { offset: self.len })?;
            self.len += pad.len() as u64;
            self.block_pos = 0;
        }

        let mut offset = 0usize;
        let mut first = true;
        while offset < payload.len() || first {
            let remaining_in_block = BLOCK_SIZE - self.block_pos;
            let space_for_payload = remaining_in_block.saturating_sub(FRAME_HEADER_LEN);
            let chunk_len = space_for_payload.min(payload.len() - offset);
            let is_last_chunk = offset + chunk_len >= payload.len();

            let frame_type = match (first, is_last_chunk) {
                (true, true) => FrameType::Full,
                (true, false) => FrameType::First,
                (false, true) => FrameType::Last,
                (false, false) => FrameType::Middle,
            };
            self.write_frame(frame_type, &payload[offset..offset + chunk_len])
                .map_err(|_| LoggerError::Truncated { offset: self.len })?;
            offset += chunk_len;
            first = false;
            if chunk_len == 0 && payload.is_empty() {
                break;
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Truncates the WAL back to empty; called right after a successful
    /// checkpoint makes every entry in it redundant.
    pub fn reset(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.len = 0;
        self.block_pos = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads logical entries back out of a WAL file, reassembling
/// First/Middle/Last chains and validating each frame's checksum.
pub struct WalReader {
    file: File,
    offset: u64,
    len: u64,
}

impl WalReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(WalReader { file, offset: 0, len })
    }

    fn read_frame(&mut self) -> Result<Option<(FrameType, Vec<u8>)>, LoggerError> {
        if self.offset >= self.len {
            return Ok(None);
        }
        let block_pos = (self.offset as usize) % BLOCK_SIZE;
        if BLOCK_SIZE - block_pos < FRAME_HEADER_LEN {
            self.offset += (BLOCK_SIZE - block_pos) as u64;
            if self.offset >= self.len {
                return Ok(None);
            }
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        self.file
            .seek(SeekFrom::Start(self.offset))
            .map_err(|_| LoggerError::Truncated { offset: self.offset })?;
        if self.file.read_exact(&mut header).is_err() {
            return Ok(None);
        }
        let checksum = (&header[0..4]).read_u32::<LittleEndian>().unwrap();
        let size = (&header[4..6]).read_u16::<LittleEndian>().unwrap() as usize;
        let frame_type = FrameType::from_u8(header[6]).ok_or(LoggerError::Truncated { offset: self.offset })?;

        if frame_type == FrameType::Zero {
            self.offset += FRAME_HEADER_LEN as u64 + size as u64;
            return self.read_frame();
        }

        let mut bytes = vec![0u8; size];
        if self.file.read_exact(&mut bytes).is_err() {
            return Ok(None);
        }
        let computed = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[frame_type as u8]);
            hasher.update(&bytes);
            hasher.finalize()
        };
        if computed != checksum {
            return Err(LoggerError::ChecksumMismatch { offset: self.offset });
        }
        self.offset += FRAME_HEADER_LEN as u64 + size as u64;
        Ok(Some((frame_type, bytes)))
    }

    /// Reads the next logical entry, or `None` at clean end of file.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>, LoggerError> {
        let mut payload = Vec::new();
        loop {
            match self.read_frame()? {
                None => {
                    return if payload.is_empty() {
                        Ok(None)
                    } else {
                        Err(LoggerError::Truncated { offset: self.offset })
                    };
                }
                Some((frame_type, bytes)) => {
                    payload.extend_from_slice(&bytes);
                    match frame_type {
                        FrameType::Full | FrameType::Last => {
                            let (entry, _) = bincode::decode_from_slice(&payload, bincode::config::standard())
                                .map_err(|_| LoggerError::Truncated { offset: self.offset })?;
                            return Ok(Some(entry));
                        }
                        FrameType::First | FrameType::Middle => continue,
                        FrameType::Zero => unreachable!("filtered out in read_frame"),
                    }
                }
            }
        }
    }
}

/// Binds WAL entries to the storage engine's apply/recover/checkpoint
/// lifecycle. One `Logger` per open database; `WalWriter`/`WalReader` only
/// know about bytes, `Logger` knows what they mean.
pub struct Logger {
    writer: WalWriter,
    max_size: u64,
}

/// Replayed transactions: those that reached `Commit` before the WAL ended.
/// Transactions that never commit (truncated mid-way, or ending in
/// `Rollback`) are discarded. Matches the teacher's `Logger::list_entries`
/// replay-on-open approach, generalized to group entries per transaction id
/// before applying them.
pub struct RecoveredTx {
    pub txid: TxId,
    pub ops: Vec<RecoveredOp>,
}

pub enum RecoveredOp {
    SubBucket { name: Vec<u8>, bucket_id: BucketId, root: PageId },
    Put { key: Vec<u8>, value: Vec<u8>, is_bucket: bool },
    Delete { key: Vec<u8> },
}

impl Logger {
    pub fn open(path: &Path, max_size: u64) -> io::Result<Self> {
        Ok(Logger {
            writer: WalWriter::open(path)?,
            max_size,
        })
    }

    pub fn begin(&mut self, txid: TxId) -> Result<(), LoggerError> {
        self.writer.append(&LogEntry::WalTxId(txid.0))?;
        self.writer.append(&LogEntry::Begin)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8], is_bucket: bool) -> Result<(), LoggerError> {
        self.writer.append(&LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            is_bucket,
        })
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), LoggerError> {
        self.writer.append(&LogEntry::Delete { key: key.to_vec() })
    }

    pub fn sub_bucket(&mut self, name: &[u8], bucket_id: BucketId, root: PageId) -> Result<(), LoggerError> {
        self.writer.append(&LogEntry::SubBucket {
            name: name.to_vec(),
            bucket_id: bucket_id.0,
            root: root.0,
        })
    }

    pub fn commit(&mut self) -> Result<(), LoggerError> {
        self.writer.append(&LogEntry::Commit)?;
        self.writer.sync().map_err(|_| LoggerError::Truncated { offset: self.writer.len() })?;
        if self.writer.len() > self.max_size {
            warn!(
                "wal size {} exceeds configured maximum {}, checkpoint overdue",
                self.writer.len(),
                self.max_size
            );
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), LoggerError> {
        self.writer.append(&LogEntry::Rollback)
    }

    pub fn should_checkpoint(&self) -> bool {
        self.writer.len() > self.max_size
    }

    /// Called once the pager/meta state a checkpoint covers is durable:
    /// the WAL is truncated back to empty since none of it is needed for
    /// recovery anymore.
    pub fn checkpoint_complete(&mut self) -> io::Result<()> {
        debug!("wal: checkpoint complete, resetting log at {} bytes", self.writer.len());
        self.writer.reset()
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Replays the WAL, grouping entries by transaction and keeping only
    /// those that reached `Commit`.
    pub fn recover(path: &Path) -> Result<Vec<RecoveredTx>, LoggerError> {
        let mut reader = match WalReader::open(path) {
            Ok(r) => r,
            Err(_) => return Ok(Vec::new()),
        };

        let mut completed = Vec::new();
        let mut current_txid: Option<TxId> = None;
        let mut current_ops: VecDeque<RecoveredOp> = VecDeque::new();

        loop {
            let entry = match reader.next_entry() {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(_) => break, // a torn final record at the tail is expected after a crash
            };
            match entry {
                LogEntry::WalTxId(id) => {
                    current_txid = Some(TxId(id));
                    current_ops.clear();
                }
                LogEntry::Begin => {}
                LogEntry::Rollback => {
                    current_txid = None;
                    current_ops.clear();
                }
                LogEntry::Commit => {
                    if let Some(txid) = current_txid.take() {
                        completed.push(RecoveredTx {
                            txid,
                            ops: current_ops.drain(..).collect(),
                        });
                    }
                }
                LogEntry::SubBucket { name, bucket_id, root } => {
                    current_ops.push_back(RecoveredOp::SubBucket {
                        name,
                        bucket_id: BucketId(bucket_id),
                        root: PageId(root),
                    });
                }
                LogEntry::Put { key, value, is_bucket } => {
                    current_ops.push_back(RecoveredOp::Put { key, value, is_bucket });
                }
                LogEntry::Delete { key } => {
                    current_ops.push_back(RecoveredOp::Delete { key });
                }
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn writes_and_reads_back_a_single_entry() {
        let dir = TempDir::new("crucible-wal").unwrap();
        let path = dir.path().join("data-wal");
        {
            let mut w = WalWriter::open(&path).unwrap();
            w.append(&LogEntry::WalTxId(1)).unwrap();
            w.append(&LogEntry::Begin).unwrap();
            w.append(&LogEntry::Put { key: b"a".to_vec(), value: b"1".to_vec(), is_bucket: false }).unwrap();
            w.append(&LogEntry::Commit).unwrap();
        }
        let mut r = WalReader::open(&path).unwrap();
        assert_eq!(r.next_entry().unwrap(), Some(LogEntry::WalTxId(1)));
        assert_eq!(r.next_entry().unwrap(), Some(LogEntry::Begin));
        assert_eq!(
            r.next_entry().unwrap(),
            Some(LogEntry::Put { key: b"a".to_vec(), value: b"1".to_vec(), is_bucket: false })
        );
        assert_eq!(r.next_entry().unwrap(), Some(LogEntry::Commit));
        assert_eq!(r.next_entry().unwrap(), None);
    }

    #[test]
    fn large_entry_spans_multiple_blocks() {
        let dir = TempDir::new("crucible-wal").unwrap();
        let path = dir.path().join("data-wal");
        let big_value = vec![9u8; BLOCK_SIZE * 2];
        {
            let mut w = WalWriter::open(&path).unwrap();
            w.append(&LogEntry::WalTxId(1)).unwrap();
            w.append(&LogEntry::Put { key: b"big".to_vec(), value: big_value.clone(), is_bucket: false }).unwrap();
            w.append(&LogEntry::Commit).unwrap();
        }
        let mut r = WalReader::open(&path).unwrap();
        assert_eq!(r.next_entry().unwrap(), Some(LogEntry::WalTxId(1)));
        match r.next_entry().unwrap() {
            Some(LogEntry::Put { value, .. }) => assert_eq!(value, big_value),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn recover_only_returns_committed_transactions() {
        let dir = TempDir::new("crucible-wal").unwrap();
        let path = dir.path().join("data-wal");
        {
            let mut w = WalWriter::open(&path).unwrap();
            w.append(&LogEntry::WalTxId(1)).unwrap();
            w.append(&LogEntry::Begin).unwrap();
            w.append(&LogEntry::Put { key: b"a".to_vec(), value: b"1".to_vec(), is_bucket: false }).unwrap();
            w.append(&LogEntry::Commit).unwrap();

            w.append(&LogEntry::WalTxId(2)).unwrap();
            w.append(&LogEntry::Begin).unwrap();
            w.append(&LogEntry::Put { key: b"b".to_vec(), value: b"2".to_vec(), is_bucket: false }).unwrap();
            w.append(&LogEntry::Rollback).unwrap();
        }
        let recovered = Logger::recover(&path).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].txid, TxId(1));
    }

    #[test]
    fn checkpoint_complete_resets_wal_to_empty() {
        let dir = TempDir::new("crucible-wal").unwrap();
        let path = dir.path().join("data-wal");
        let mut logger = Logger::open(&path, 1024).unwrap();
        logger.begin(TxId(1)).unwrap();
        logger.put(b"a", b"1", false).unwrap();
        logger.commit().unwrap();
        assert!(logger.writer.len() > 0);
        logger.checkpoint_complete().unwrap();
        assert_eq!(logger.writer.len(), 0);
    }
}
