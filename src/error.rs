//! Error types for CaskDB
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::data::DecodeError;

/// Result type alias using CaskError
pub type Result<T> = std::result::Result<T, CaskError>;

/// Unified error type for CaskDB operations
#[derive(Debug, Error)]
pub enum CaskError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Input Errors
    // -------------------------------------------------------------------------
    #[error("The key is empty")]
    EmptyKey,

    #[error("Key not found")]
    KeyNotFound,

    // -------------------------------------------------------------------------
    // Log / Data File Errors
    // -------------------------------------------------------------------------
    /// A single record could not be decoded: short read or checksum mismatch.
    #[error("Corrupt or incomplete record in file {file_id} at offset {offset}: {source}")]
    CorruptRecord {
        file_id: u32,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    /// A failed append left bytes the segment could not roll back.
    #[error("Data file {file_id} refuses appends after a failed rollback")]
    SegmentPoisoned { file_id: u32 },

    /// The index points at a segment that is not open.
    #[error("Data file {file_id} is missing")]
    DataFileMissing { file_id: u32 },

    /// Corruption outside the tolerated tail of the newest segment.
    #[error("The database directory may be corrupted (file {file_id}, offset {offset})")]
    DirectoryCorrupted { file_id: u32, offset: u64 },

    #[error("The database directory {path:?} is used by another process")]
    DirectoryLocked { path: PathBuf },

    // -------------------------------------------------------------------------
    // Index Errors
    // -------------------------------------------------------------------------
    #[error("Failed to update index: {0}")]
    IndexUpdateFailed(String),

    // -------------------------------------------------------------------------
    // Merge Errors
    // -------------------------------------------------------------------------
    #[error("Merge is in progress, try again later")]
    MergeInProgress,

    #[error("Merge output reached file id {file_id}, which is still in use")]
    MergeOverflow { file_id: u32 },

    // -------------------------------------------------------------------------
    // Write Batch Errors
    // -------------------------------------------------------------------------
    #[error("Write batch commit failed: {0}")]
    BatchCommitFailed(#[source] Box<CaskError>),

    #[error("Write batch exceeds the maximum of {max} entries")]
    ExceedMaxBatchNum { max: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for CaskError {
    fn from(err: bincode::Error) -> Self {
        CaskError::Serialization(err.to_string())
    }
}
