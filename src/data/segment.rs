//! Segment files
//!
//! A segment is one append-only file holding a contiguous run of log records.
//! Only the active segment accepts appends; sealed segments are read-only.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::error;

use crate::error::{CaskError, Result};

use super::log_record::{
    decode_header, decode_log_record, DecodeError, LogRecord, LogRecordPos, MAX_HEADER_SIZE,
};

/// Suffix of every segment file name
pub const DATA_FILE_SUFFIX: &str = ".data";

/// File written by merge, mapping keys to their merged positions
pub const HINT_FILE_NAME: &str = "hint-index";

/// Append-only log file identified by a numeric id
///
/// ## Concurrency:
/// - `append` serializes on `write_off`, so no two appends observe the same offset
/// - Reads are positional and never move a shared cursor; they only need `&self`
pub struct SegmentFile {
    file_id: u32,
    path: PathBuf,
    file: File,
    /// Next byte to be written (== file length)
    write_off: Mutex<u64>,
    /// Set when a failed append could not be rolled back
    poisoned: AtomicBool,
}

impl SegmentFile {
    /// Open or create the segment `file_id` in `dir`
    pub fn open(dir: &Path, file_id: u32) -> Result<Self> {
        Self::open_path(segment_path(dir, file_id), file_id)
    }

    /// Open or create the hint file in `dir`
    pub fn open_hint(dir: &Path) -> Result<Self> {
        Self::open_path(dir.join(HINT_FILE_NAME), 0)
    }

    /// Open or create an arbitrary file in the segment format
    pub fn open_path(path: PathBuf, file_id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file_id,
            path,
            file,
            write_off: Mutex::new(len),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write offset, which is also the readable length
    pub fn write_offset(&self) -> u64 {
        *self.write_off.lock()
    }

    /// Append `buf`, returning the offset it was written at
    ///
    /// A failed write is rolled back to the previous length. If that rollback
    /// fails too, the segment refuses further appends: the file may hold a
    /// partial frame that `write_offset` does not account for.
    pub fn append(&self, buf: &[u8]) -> Result<u64> {
        let mut write_off = self.write_off.lock();
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CaskError::SegmentPoisoned {
                file_id: self.file_id,
            });
        }
        let offset = *write_off;

        if let Err(e) = (&self.file).write_all(buf) {
            if let Err(rollback) = self.file.set_len(offset) {
                self.poisoned.store(true, Ordering::Release);
                error!(
                    file_id = self.file_id,
                    offset,
                    error = %rollback,
                    "failed to roll back partial append"
                );
            }
            return Err(e.into());
        }

        *write_off += buf.len() as u64;
        Ok(offset)
    }

    /// Read up to `max_len` bytes starting at `offset`
    ///
    /// Returns fewer bytes when the segment ends first.
    pub fn read_at(&self, offset: u64, max_len: usize) -> Result<Vec<u8>> {
        let size = self.write_offset();
        if offset >= size {
            return Ok(Vec::new());
        }

        let len = max_len.min((size - offset) as usize);
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    /// Read the record that starts at `offset`
    ///
    /// Returns:
    /// - `Ok(Some((record, size)))`: a valid record and its encoded size
    /// - `Ok(None)`: `offset` is the end of the segment
    /// - `Err(CorruptRecord)`: short frame or checksum mismatch
    pub fn read_record(&self, offset: u64) -> Result<Option<(LogRecord, usize)>> {
        let size = self.write_offset();
        if offset >= size {
            return Ok(None);
        }

        let head = self.read_at(offset, MAX_HEADER_SIZE)?;
        let header = decode_header(&head).map_err(|source| self.corrupt(offset, source))?;
        let total = header.record_size();
        if offset + total as u64 > size {
            return Err(self.corrupt(offset, DecodeError::Truncated));
        }

        let frame = if total <= head.len() {
            head
        } else {
            self.read_at(offset, total)?
        };
        let (record, read) =
            decode_log_record(&frame).map_err(|source| self.corrupt(offset, source))?;

        Ok(Some((record, read)))
    }

    /// Append a hint entry: user key → merged position
    pub fn write_hint(&self, key: &[u8], pos: LogRecordPos) -> Result<()> {
        let record = LogRecord::normal(key.to_vec(), pos.encode());
        self.append(&record.encode())?;
        Ok(())
    }

    /// Force written bytes to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Cut the segment back to `len` bytes (drops a corrupt tail)
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut write_off = self.write_off.lock();
        self.file.set_len(len)?;
        *write_off = len;
        self.poisoned.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether appends are refused after a failed rollback
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Sync and release the file handle
    pub fn close(self) -> Result<()> {
        self.sync()
    }

    fn corrupt(&self, offset: u64, source: DecodeError) -> CaskError {
        CaskError::CorruptRecord {
            file_id: self.file_id,
            offset,
            source,
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// =============================================================================
// Path Helpers
// =============================================================================

/// "000000042.data" for id 42
pub fn segment_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{:09}{}", file_id, DATA_FILE_SUFFIX))
}

/// "000000042.data" → Some(42)
pub fn parse_segment_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let id_str = name.strip_suffix(DATA_FILE_SUFFIX)?;
    id_str.parse().ok()
}

/// Ids of all segment files in `dir`, ascending
pub fn list_segment_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(id) = parse_segment_id(&path) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
