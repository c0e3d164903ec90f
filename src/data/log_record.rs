//! Log record definitions and codec
//!
//! Defines the structure of individual records in a segment file and their
//! on-disk frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::varint::{
    decode_uvarint, decode_uvarint32, put_uvarint, varint_len, VarintError, MAX_VARINT_LEN32,
};

/// CRC field width
pub const CRC_SIZE: usize = 4;

/// Largest possible header: CRC (4) + Type (1) + KeyLen (≤5) + ValueLen (≤5)
pub const MAX_HEADER_SIZE: usize = CRC_SIZE + 1 + MAX_VARINT_LEN32 * 2;

/// Sequence number carried by records written outside a write batch
pub const NON_TXN_SEQ_NO: u64 = 0;

/// User key of the marker that closes a write batch
pub const TXN_FIN_KEY: &[u8] = b"txn-fin";

// =============================================================================
// Record Types
// =============================================================================

/// Kind of mutation a record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// A live key/value pair
    Normal = 0,

    /// A tombstone; the value is empty
    Deleted = 1,

    /// Commit marker of a write batch
    TxnFinished = 2,
}

impl LogRecordType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Normal),
            1 => Some(Self::Deleted),
            2 => Some(Self::TxnFinished),
            _ => None,
        }
    }
}

/// A single mutation as written to a segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub rec_type: LogRecordType,
}

impl LogRecord {
    pub fn normal(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            rec_type: LogRecordType::Normal,
        }
    }

    pub fn deleted(key: Vec<u8>) -> Self {
        Self {
            key,
            value: Vec::new(),
            rec_type: LogRecordType::Deleted,
        }
    }

    /// Commit marker for the batch tagged `seq_no`
    pub fn txn_finished(seq_no: u64) -> Self {
        Self {
            key: log_record_key_with_seq(TXN_FIN_KEY, seq_no),
            value: Vec::new(),
            rec_type: LogRecordType::TxnFinished,
        }
    }

    /// Size of the encoded frame
    pub fn encoded_len(&self) -> usize {
        CRC_SIZE
            + 1
            + varint_len(self.key.len() as u64)
            + varint_len(self.value.len() as u64)
            + self.key.len()
            + self.value.len()
    }

    /// Encode into the on-disk frame
    ///
    /// Format: crc (4, LE) + type (1) + key_len (varint) + value_len (varint) + key + value.
    /// The CRC covers everything after the CRC field.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(0);
        buf.put_u8(self.rec_type as u8);
        put_uvarint(&mut buf, self.key.len() as u64);
        put_uvarint(&mut buf, self.value.len() as u64);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);

        let crc = crc32fast::hash(&buf[CRC_SIZE..]);
        buf[..CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        buf.freeze()
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Why a frame could not be decoded
///
/// Every variant means "corrupt or incomplete record": recovery treats it as
/// the end of the valid log rather than as an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record is truncated")]
    Truncated,

    #[error("record header is malformed")]
    Malformed,

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("unknown record type {0}")]
    UnknownType(u8),
}

impl From<VarintError> for DecodeError {
    fn from(err: VarintError) -> Self {
        match err {
            VarintError::Truncated => DecodeError::Truncated,
            VarintError::Overflow => DecodeError::Malformed,
        }
    }
}

/// Parsed fixed part of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordHeader {
    pub crc: u32,
    pub rec_type: u8,
    pub key_size: u32,
    pub value_size: u32,
    /// Bytes the header itself occupies
    pub header_size: usize,
}

impl LogRecordHeader {
    /// Size of the whole frame this header announces
    pub fn record_size(&self) -> usize {
        self.header_size + self.key_size as usize + self.value_size as usize
    }
}

/// Decode the header at the start of `buf`
pub fn decode_header(buf: &[u8]) -> Result<LogRecordHeader, DecodeError> {
    if buf.len() < CRC_SIZE + 1 {
        return Err(DecodeError::Truncated);
    }

    let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let rec_type = buf[CRC_SIZE];

    let mut index = CRC_SIZE + 1;
    let (key_size, read) = decode_uvarint32(&buf[index..])?;
    index += read;
    let (value_size, read) = decode_uvarint32(&buf[index..])?;
    index += read;

    Ok(LogRecordHeader {
        crc,
        rec_type,
        key_size,
        value_size,
        header_size: index,
    })
}

/// Decode one frame from the start of `buf`
///
/// Returns the record and the number of bytes it occupied.
pub fn decode_log_record(buf: &[u8]) -> Result<(LogRecord, usize), DecodeError> {
    let header = decode_header(buf)?;
    let total = header.record_size();
    if buf.len() < total {
        return Err(DecodeError::Truncated);
    }

    let computed = crc32fast::hash(&buf[CRC_SIZE..total]);
    if computed != header.crc {
        return Err(DecodeError::ChecksumMismatch {
            stored: header.crc,
            computed,
        });
    }

    let rec_type =
        LogRecordType::from_u8(header.rec_type).ok_or(DecodeError::UnknownType(header.rec_type))?;
    let key_end = header.header_size + header.key_size as usize;
    let record = LogRecord {
        key: buf[header.header_size..key_end].to_vec(),
        value: buf[key_end..total].to_vec(),
        rec_type,
    };

    Ok((record, total))
}

// =============================================================================
// Record Positions
// =============================================================================

/// Where a record lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecordPos {
    pub file_id: u32,
    pub offset: u64,
    /// Encoded frame length, used for reclaimable-space accounting
    pub size: u32,
}

impl LogRecordPos {
    /// Encode as three varints: file_id, offset, size
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            varint_len(self.file_id as u64) + varint_len(self.offset) + varint_len(self.size as u64),
        );
        put_uvarint(&mut buf, self.file_id as u64);
        put_uvarint(&mut buf, self.offset);
        put_uvarint(&mut buf, self.size as u64);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (file_id, mut index) = decode_uvarint32(buf)?;
        let (offset, read) = decode_uvarint(&buf[index..])?;
        index += read;
        let (size, _) = decode_uvarint32(&buf[index..])?;
        Ok(Self {
            file_id,
            offset,
            size,
        })
    }
}

// =============================================================================
// Batch Sequence Keys
// =============================================================================

/// Prefix `key` with the batch sequence number that wrote it
pub fn log_record_key_with_seq(key: &[u8], seq_no: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(varint_len(seq_no) + key.len());
    put_uvarint(&mut buf, seq_no);
    buf.extend_from_slice(key);
    buf
}

/// Split a log key into the user key and its batch sequence number
pub fn parse_log_record_key(key: &[u8]) -> Result<(Vec<u8>, u64), DecodeError> {
    let (seq_no, read) = decode_uvarint(key)?;
    Ok((key[read..].to_vec(), seq_no))
}
