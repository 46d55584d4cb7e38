//! Redo log.
//!
//! Every durable atomic operation appends the logical changes it made to
//! an index (one record per put or remove) followed by a commit marker.
//! Replaying the committed records of an operation against a tree restores
//! the effect of that operation.
//!
//! # Log Record Format
//!
//! Each record has the following layout:
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, includes header+payload) |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | op_id (8 bytes)                                  |
//! | 13-20    | lsn (8 bytes) - Log Sequence Number              |
//! | 21-N     | payload (variable, depends on type)              |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```
//!
//! The log is append-only. A torn or corrupt record ends the readable log.

// record_length fits in u32
#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::types::rid::{RID_SIZE, Rid};

/// Log record header size (before payload).
/// `record_length` (4) + `record_type` (1) + `op_id` (8) + lsn (8) = 21 bytes
const RECORD_HEADER_SIZE: usize = 21;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// Log Sequence Number - monotonically increasing identifier for log records.
pub type Lsn = u64;

/// Atomic operation identifier.
pub type OperationId = u64;

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Key/value pair added to an index.
    Put = 0x01,
    /// Key/value pair removed from an index.
    Remove = 0x02,
    /// Operation commit marker.
    Commit = 0x03,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Put),
            0x02 => Ok(Self::Remove),
            0x03 => Ok(Self::Commit),
            _ => Err(value),
        }
    }
}

/// Kind of change described by a [`RedoRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoOperation {
    Put,
    Remove,
}

/// Logical change to one index.
///
/// `serialized_key` is the plain serialized key, never the encrypted form;
/// `None` is the null key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRecord {
    pub operation: RedoOperation,
    pub index_id: u32,
    pub key_serializer_id: u8,
    pub encryption_name: Option<String>,
    pub serialized_key: Option<Vec<u8>>,
    pub value: Rid,
}

impl RedoRecord {
    fn to_bytes(&self) -> Vec<u8> {
        let key_len = self.serialized_key.as_ref().map_or(0, Vec::len);
        let name_len = self.encryption_name.as_ref().map_or(0, String::len);
        let mut bytes = Vec::with_capacity(16 + key_len + name_len + RID_SIZE);

        bytes.extend_from_slice(&self.index_id.to_le_bytes());
        bytes.push(self.key_serializer_id);
        write_optional(&mut bytes, self.encryption_name.as_deref().map(str::as_bytes));
        write_optional(&mut bytes, self.serialized_key.as_deref());
        bytes.extend_from_slice(&self.value.to_bytes());
        bytes
    }

    fn from_bytes(operation: RedoOperation, bytes: &[u8]) -> Result<Self, WalError> {
        let mut pos = 0;
        let raw = take(bytes, &mut pos, 4)?;
        let index_id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let key_serializer_id = take(bytes, &mut pos, 1)?[0];
        let encryption_name = read_optional(bytes, &mut pos)?
            .map(|raw| String::from_utf8(raw.to_vec()).map_err(|_| WalError::CorruptRecord))
            .transpose()?;
        let serialized_key = read_optional(bytes, &mut pos)?.map(<[u8]>::to_vec);
        let value = Rid::from_bytes(take(bytes, &mut pos, RID_SIZE)?).ok_or(WalError::CorruptRecord)?;
        if pos != bytes.len() {
            return Err(WalError::CorruptRecord);
        }

        Ok(Self {
            operation,
            index_id,
            key_serializer_id,
            encryption_name,
            serialized_key,
            value,
        })
    }
}

fn write_optional(bytes: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            bytes.push(1);
            bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
            bytes.extend_from_slice(value);
        }
        None => bytes.push(0),
    }
}

fn read_optional<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, WalError> {
    match take(bytes, pos, 1)?[0] {
        0 => Ok(None),
        1 => {
            let raw = take(bytes, pos, 4)?;
            let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
            Ok(Some(take(bytes, pos, len)?))
        }
        _ => Err(WalError::CorruptRecord),
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], WalError> {
    let end = pos.checked_add(len).ok_or(WalError::CorruptRecord)?;
    let slice = bytes.get(*pos..end).ok_or(WalError::CorruptRecord)?;
    *pos = end;
    Ok(slice)
}

/// Payload for different log record types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordPayload {
    Put(RedoRecord),
    Remove(RedoRecord),
    /// Commit operation - no additional data.
    Commit,
}

impl LogRecordPayload {
    /// Wrap a redo record in the payload matching its operation.
    #[must_use]
    pub const fn change(record: RedoRecord) -> Self {
        match record.operation {
            RedoOperation::Put => Self::Put(record),
            RedoOperation::Remove => Self::Remove(record),
        }
    }

    /// Get the record type for this payload.
    #[must_use]
    pub const fn record_type(&self) -> LogRecordType {
        match self {
            Self::Put(_) => LogRecordType::Put,
            Self::Remove(_) => LogRecordType::Remove,
            Self::Commit => LogRecordType::Commit,
        }
    }

    /// The redo record carried by a change payload.
    #[must_use]
    pub const fn redo(&self) -> Option<&RedoRecord> {
        match self {
            Self::Put(record) | Self::Remove(record) => Some(record),
            Self::Commit => None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.redo().map(RedoRecord::to_bytes).unwrap_or_default()
    }

    fn from_bytes(record_type: LogRecordType, bytes: &[u8]) -> Result<Self, WalError> {
        match record_type {
            LogRecordType::Commit => {
                if bytes.is_empty() {
                    Ok(Self::Commit)
                } else {
                    Err(WalError::CorruptRecord)
                }
            }
            LogRecordType::Put => Ok(Self::Put(RedoRecord::from_bytes(RedoOperation::Put, bytes)?)),
            LogRecordType::Remove => Ok(Self::Remove(RedoRecord::from_bytes(
                RedoOperation::Remove,
                bytes,
            )?)),
        }
    }
}

/// A complete log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Atomic operation that wrote this record.
    pub op_id: OperationId,
    /// Log Sequence Number.
    pub lsn: Lsn,
    /// The record payload.
    pub payload: LogRecordPayload,
}

impl LogRecord {
    /// Create a new log record.
    #[must_use]
    pub const fn new(op_id: OperationId, lsn: Lsn, payload: LogRecordPayload) -> Self {
        Self {
            op_id,
            lsn,
            payload,
        }
    }

    /// Serialize this record to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_bytes = self.payload.to_bytes();
        let total_len = RECORD_HEADER_SIZE + payload_bytes.len() + CHECKSUM_SIZE;

        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&(total_len as u32).to_le_bytes());
        bytes.push(self.payload.record_type() as u8);
        bytes.extend_from_slice(&self.op_id.to_le_bytes());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&payload_bytes);

        // CRC32 checksum - computed over everything before it
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        bytes
    }

    /// Deserialize a record from bytes.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalError> {
        if bytes.len() < RECORD_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(WalError::CorruptRecord);
        }

        let record_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if record_len < RECORD_HEADER_SIZE + CHECKSUM_SIZE || record_len > bytes.len() {
            return Err(WalError::CorruptRecord);
        }

        let stored_checksum = u32::from_le_bytes([
            bytes[record_len - 4],
            bytes[record_len - 3],
            bytes[record_len - 2],
            bytes[record_len - 1],
        ]);
        let computed_checksum = crc32fast::hash(&bytes[..record_len - 4]);
        if stored_checksum != computed_checksum {
            return Err(WalError::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        let record_type = LogRecordType::try_from(bytes[4]).map_err(WalError::InvalidRecordType)?;
        let mut op_id = [0u8; 8];
        op_id.copy_from_slice(&bytes[5..13]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&bytes[13..21]);

        let payload_bytes = &bytes[RECORD_HEADER_SIZE..record_len - CHECKSUM_SIZE];
        let payload = LogRecordPayload::from_bytes(record_type, payload_bytes)?;

        Ok((
            Self {
                op_id: u64::from_le_bytes(op_id),
                lsn: u64::from_le_bytes(lsn),
                payload,
            },
            record_len,
        ))
    }
}

/// Decode records from the start of `bytes` up to the first bad record.
///
/// Returns the records and the number of bytes they span.
#[must_use]
pub fn decode_records(bytes: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        match LogRecord::from_bytes(&bytes[offset..]) {
            Ok((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            Err(e) => {
                tracing::warn!("Redo log ends at offset {offset}: {e}");
                break;
            }
        }
    }
    (records, offset)
}

enum LogBackend {
    Memory(Vec<u8>),
    File(File),
}

/// Append-only redo log, kept in memory or in a file.
pub struct RedoLog {
    backend: LogBackend,
    next_lsn: Lsn,
}

impl RedoLog {
    /// Create an empty log held in memory.
    #[must_use]
    pub const fn in_memory() -> Self {
        Self {
            backend: LogBackend::Memory(Vec::new()),
            next_lsn: 1,
        }
    }

    /// Open or create a log file.
    ///
    /// Existing records are scanned to continue the LSN sequence. A torn
    /// tail left by a crash is truncated.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (records, valid_len) = decode_records(&bytes);
        if valid_len < bytes.len() {
            file.set_len(valid_len as u64)?;
        }
        file.seek(SeekFrom::End(0))?;

        let next_lsn = records.last().map_or(1, |r| r.lsn + 1);
        Ok(Self {
            backend: LogBackend::File(file),
            next_lsn,
        })
    }

    /// Get the next LSN that will be assigned.
    #[must_use]
    pub const fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Append a log record.
    ///
    /// Returns the LSN assigned to this record.
    pub fn append(&mut self, op_id: OperationId, payload: LogRecordPayload) -> Result<Lsn, WalError> {
        let lsn = self.next_lsn;
        let bytes = LogRecord::new(op_id, lsn, payload).to_bytes();
        match &mut self.backend {
            LogBackend::Memory(buffer) => buffer.extend_from_slice(&bytes),
            LogBackend::File(file) => file.write_all(&bytes)?,
        }
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Sync the log to disk.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if let LogBackend::File(file) = &mut self.backend {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Read every readable record, oldest first.
    pub fn read_all(&mut self) -> Result<Vec<LogRecord>, WalError> {
        let bytes = match &mut self.backend {
            LogBackend::Memory(buffer) => return Ok(decode_records(buffer).0),
            LogBackend::File(file) => {
                let mut bytes = Vec::new();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut bytes)?;
                bytes
            }
        };
        Ok(decode_records(&bytes).0)
    }

    /// Raw bytes of an in-memory log; `None` for a file log.
    #[must_use]
    pub fn memory_bytes(&self) -> Option<&[u8]> {
        match &self.backend {
            LogBackend::Memory(buffer) => Some(buffer),
            LogBackend::File(_) => None,
        }
    }
}

impl Default for RedoLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Errors that can occur during redo log operations.
#[derive(Debug)]
pub enum WalError {
    /// I/O error.
    Io(std::io::Error),
    /// Corrupt log record.
    CorruptRecord,
    /// Invalid record type byte.
    InvalidRecordType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "WAL I/O error: {e}"),
            Self::CorruptRecord => write!(f, "corrupt WAL record"),
            Self::InvalidRecordType(t) => write!(f, "invalid WAL record type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "WAL checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(key: &[u8], position: i64) -> RedoRecord {
        RedoRecord {
            operation: RedoOperation::Put,
            index_id: 7,
            key_serializer_id: 14,
            encryption_name: None,
            serialized_key: Some(key.to_vec()),
            value: Rid::new(3, position),
        }
    }

    #[test]
    fn test_log_record_put() {
        let record = LogRecord::new(42, 200, LogRecordPayload::change(put(b"k1", 9)));
        let bytes = record.to_bytes();
        let (decoded, consumed) = LogRecord::from_bytes(&bytes).expect("decode");

        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_log_record_null_key_remove() {
        let redo = RedoRecord {
            operation: RedoOperation::Remove,
            index_id: 1,
            key_serializer_id: 10,
            encryption_name: Some("xor".to_string()),
            serialized_key: None,
            value: Rid::new(-1, 5),
        };
        let record = LogRecord::new(1, 2, LogRecordPayload::change(redo));
        let (decoded, _) = LogRecord::from_bytes(&record.to_bytes()).expect("decode");

        let LogRecordPayload::Remove(decoded) = decoded.payload else {
            panic!("expected Remove payload");
        };
        assert_eq!(decoded.serialized_key, None);
        assert_eq!(decoded.encryption_name.as_deref(), Some("xor"));
    }

    #[test]
    fn test_corrupted_record_detected() {
        let record = LogRecord::new(1, 1, LogRecordPayload::Commit);
        let mut bytes = record.to_bytes();
        bytes[10] ^= 0xFF;

        assert!(matches!(
            LogRecord::from_bytes(&bytes),
            Err(WalError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let mut log = RedoLog::in_memory();
        log.append(1, LogRecordPayload::change(put(b"a", 1)))
            .expect("append");
        log.append(1, LogRecordPayload::Commit).expect("append");

        let mut bytes = log.memory_bytes().expect("memory log").to_vec();
        let full = bytes.len();
        bytes.extend_from_slice(&LogRecord::new(2, 3, LogRecordPayload::Commit).to_bytes()[..10]);

        let (records, valid) = decode_records(&bytes);
        assert_eq!(records.len(), 2);
        assert_eq!(valid, full);
    }

    #[test]
    fn test_file_log_reopen_continues_lsn() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("redo.log");

        {
            let mut log = RedoLog::open(&path).expect("open");
            assert_eq!(log.append(5, LogRecordPayload::change(put(b"x", 1))).expect("append"), 1);
            assert_eq!(log.append(5, LogRecordPayload::Commit).expect("append"), 2);
            log.sync().expect("sync");
        }

        // Simulate a crash in the middle of a write
        let mut raw = std::fs::read(&path).expect("read raw");
        let intact = raw.len();
        raw.extend_from_slice(&[0x30, 0, 0, 0, 1]);
        std::fs::write(&path, raw).expect("write raw");

        let mut log = RedoLog::open(&path).expect("reopen");
        assert_eq!(log.next_lsn(), 3);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), intact as u64);

        log.append(6, LogRecordPayload::Commit).expect("append");
        let records = log.read_all().expect("read all");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].op_id, 6);
        assert_eq!(records[2].lsn, 3);
    }
}
