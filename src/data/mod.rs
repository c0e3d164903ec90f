//! Data Module
//!
//! The append-only log: record encoding and segment files.
//!
//! ## Responsibilities
//! - Encode/decode log records with CRC32 checksums
//! - Tag records with the write batch that produced them
//! - Append to and read from numbered segment files
//! - Detect truncated or corrupt frames without treating them as I/O errors
//!
//! ## Record Format
//! ```text
//! ┌──────────┬──────────┬───────────────┬───────────────┬───────┬─────────┐
//! │ CRC (4)  │ Type (1) │ KeyLen (var)  │ ValLen (var)  │  Key  │  Value  │
//! └──────────┴──────────┴───────────────┴───────────────┴───────┴─────────┘
//! ```
//! The stored key is `varint(seq_no) ++ user_key`; `seq_no == 0` marks a
//! write that did not come from a batch.

mod log_record;
mod segment;
mod varint;

pub use log_record::{
    decode_header, decode_log_record, log_record_key_with_seq, parse_log_record_key, DecodeError,
    LogRecord, LogRecordHeader, LogRecordPos, LogRecordType, CRC_SIZE, MAX_HEADER_SIZE,
    NON_TXN_SEQ_NO, TXN_FIN_KEY,
};
pub use segment::{
    list_segment_ids, parse_segment_id, segment_path, SegmentFile, DATA_FILE_SUFFIX,
    HINT_FILE_NAME,
};
pub use varint::{decode_uvarint, put_uvarint, varint_len, VarintError};
