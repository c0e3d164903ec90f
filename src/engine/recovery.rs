//! Startup recovery
//!
//! Rebuilds the index from the hint file and the segment log.
//!
//! ## Recovery Process
//! ```text
//!   merge-finished? ──yes──► load hint-index, replay from non_merge_file_id
//!          │no
//!          ▼
//!   replay every segment from file 0
//!
//!   per record:
//!     seq == 0           → apply now
//!     seq != 0, Normal   → stage under seq
//!     seq != 0, Deleted  → stage under seq
//!     TxnFinished(seq)   → apply everything staged under seq
//! ```
//! Staged records whose marker never arrived belong to a batch that was cut
//! short by a crash and are dropped.
//!
//! ## Corruption
//! A record that fails to decode at the end of the newest segment is a torn
//! write: the file is truncated there and recovery continues. A bad frame
//! with intact records after it, in any segment, means the directory is
//! damaged and open fails.
//!
//! ## Disk Index
//! A clean close of a `Disk`-backed engine writes an `index-checkpoint`
//! recording how far the journal is known to be in step with the log. Open
//! consumes it and only replays records written after it. Without a
//! checkpoint (crash, backup copy, interrupted merge) the index is rebuilt.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Config, IndexBackend};
use crate::data::{
    decode_header, parse_log_record_key, DecodeError, LogRecordPos, LogRecordType, SegmentFile,
    MAX_HEADER_SIZE, NON_TXN_SEQ_NO,
};
use crate::error::{CaskError, Result};
use crate::index::Indexer;
use crate::merge;

use super::Segments;

/// Checkpoint file name inside the data directory
pub const CHECKPOINT_FILE_NAME: &str = "index-checkpoint";

/// Read size when checking that a damaged tail is only zero fill
const ZERO_SCAN_CHUNK: usize = 64 * 1024;

/// Recovery statistics
#[derive(Debug, Clone, Default)]
pub(crate) struct RecoveryResult {
    /// Records decoded from the log
    pub(crate) records_replayed: usize,

    /// Write batches committed in the replayed range
    pub(crate) batches_committed: usize,

    /// Write batches without a commit marker
    pub(crate) batches_discarded: usize,

    /// Bytes cut from the tail of the newest segment
    pub(crate) truncated_bytes: u64,

    /// Highest batch sequence number seen
    pub(crate) seq_no: u64,

    /// Bytes a merge could reclaim in the replayed range
    pub(crate) reclaimable: u64,

    /// Whether the disk index checkpoint was used
    pub(crate) used_checkpoint: bool,
}

/// Where the disk index stopped being in step with the log
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct IndexCheckpoint {
    seq_no: u64,
    file_id: u32,
    offset: u64,
}

/// First log position to replay
#[derive(Debug, Clone, Copy, Default)]
struct ReplayStart {
    file_id: u32,
    offset: u64,
}

/// A batch record waiting for its commit marker
struct StagedRecord {
    key: Vec<u8>,
    rec_type: LogRecordType,
    pos: LogRecordPos,
}

/// Rebuild `index` from the files in the data directory
///
/// `merge_applied` is true when open just finished an interrupted merge,
/// which invalidates any disk index checkpoint.
pub(crate) fn recover(
    config: &Config,
    segments: &Segments,
    index: &dyn Indexer,
    merge_applied: bool,
) -> Result<RecoveryResult> {
    let dir = config.data_dir.as_path();
    let mut result = RecoveryResult::default();
    let mut start = ReplayStart::default();

    if config.index_backend == IndexBackend::Disk {
        match take_checkpoint(dir)? {
            Some(checkpoint) if !merge_applied => {
                debug!(?checkpoint, "resuming disk index from checkpoint");
                start = ReplayStart {
                    file_id: checkpoint.file_id,
                    offset: checkpoint.offset,
                };
                result.seq_no = checkpoint.seq_no;
                result.used_checkpoint = true;
            }
            _ => index.clear()?,
        }
    }

    // Rebuilt entries are synced once at the end, not one by one. A crash
    // before that leaves no checkpoint, so the next open rebuilds again.
    index.set_deferred_sync(true);
    let rebuilt = load_and_replay(dir, segments, index, start, &mut result);
    index.set_deferred_sync(false);
    rebuilt?;
    index.sync()?;

    info!(
        records = result.records_replayed,
        batches = result.batches_committed,
        discarded = result.batches_discarded,
        truncated = result.truncated_bytes,
        checkpoint = result.used_checkpoint,
        "recovery complete"
    );
    Ok(result)
}

fn load_and_replay(
    dir: &Path,
    segments: &Segments,
    index: &dyn Indexer,
    mut start: ReplayStart,
    result: &mut RecoveryResult,
) -> Result<()> {
    if !result.used_checkpoint {
        if let Some(non_merge_file_id) = merge::load_hint_index(dir, index)? {
            start = ReplayStart {
                file_id: non_merge_file_id,
                offset: 0,
            };
        }
    }
    replay(segments, index, start, result)
}

fn replay(
    segments: &Segments,
    index: &dyn Indexer,
    start: ReplayStart,
    result: &mut RecoveryResult,
) -> Result<()> {
    let newest = segments.active.file_id();
    let mut staged: HashMap<u64, Vec<StagedRecord>> = HashMap::new();

    for segment in segments.iter().filter(|s| s.file_id() >= start.file_id) {
        let file_id = segment.file_id();
        let mut offset = if file_id == start.file_id { start.offset } else { 0 };

        loop {
            let (record, size) = match segment.read_record(offset) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(CaskError::CorruptRecord { source, .. }) => {
                    if file_id != newest || !is_torn_tail(segment, offset, source)? {
                        error!(file_id, offset, error = %source, "corrupt record inside the log");
                        return Err(CaskError::DirectoryCorrupted { file_id, offset });
                    }
                    let cut = segment.write_offset().saturating_sub(offset);
                    warn!(file_id, offset, bytes = cut, error = %source, "truncating torn write");
                    segment.truncate(offset)?;
                    result.truncated_bytes += cut;
                    break;
                }
                Err(e) => return Err(e),
            };

            let pos = LogRecordPos {
                file_id,
                offset,
                size: size as u32,
            };
            let (key, seq_no) = parse_log_record_key(&record.key)
                .map_err(|_| CaskError::DirectoryCorrupted { file_id, offset })?;

            if seq_no == NON_TXN_SEQ_NO {
                apply(index, key, record.rec_type, pos, result)?;
            } else if record.rec_type == LogRecordType::TxnFinished {
                for entry in staged.remove(&seq_no).unwrap_or_default() {
                    apply(index, entry.key, entry.rec_type, entry.pos, result)?;
                }
                result.reclaimable += pos.size as u64;
                result.batches_committed += 1;
            } else {
                staged.entry(seq_no).or_default().push(StagedRecord {
                    key,
                    rec_type: record.rec_type,
                    pos,
                });
            }

            result.seq_no = result.seq_no.max(seq_no);
            result.records_replayed += 1;
            offset += size as u64;
        }

        debug!(file_id, end = offset, "segment replayed");
    }

    for (seq_no, records) in staged {
        warn!(seq_no, records = records.len(), "discarding uncommitted write batch");
        result.batches_discarded += 1;
        result.reclaimable += records.iter().map(|r| r.pos.size as u64).sum::<u64>();
    }
    Ok(())
}

/// Whether the bad frame at `offset` can only be an interrupted last append
///
/// True when the frame runs past the end of the segment, when its declared
/// length ends exactly at the end, or when the rest of the segment is zero
/// fill. Anything else has valid bytes after it and must not be cut.
fn is_torn_tail(segment: &SegmentFile, offset: u64, source: DecodeError) -> Result<bool> {
    if source == DecodeError::Truncated {
        return Ok(true);
    }

    let end = segment.write_offset();
    if let DecodeError::ChecksumMismatch { .. } = source {
        let head = segment.read_at(offset, MAX_HEADER_SIZE)?;
        if let Ok(header) = decode_header(&head) {
            if offset + header.record_size() as u64 == end {
                return Ok(true);
            }
        }
    }

    let mut at = offset;
    while at < end {
        let chunk = segment.read_at(at, ZERO_SCAN_CHUNK)?;
        if chunk.iter().any(|b| *b != 0) {
            return Ok(false);
        }
        at += chunk.len() as u64;
    }
    Ok(true)
}

fn apply(
    index: &dyn Indexer,
    key: Vec<u8>,
    rec_type: LogRecordType,
    pos: LogRecordPos,
    result: &mut RecoveryResult,
) -> Result<()> {
    match rec_type {
        LogRecordType::Normal => {
            if let Some(old) = index.put(key, pos)? {
                result.reclaimable += old.size as u64;
            }
        }
        LogRecordType::Deleted => {
            result.reclaimable += pos.size as u64;
            if let Some(old) = index.delete(&key)? {
                result.reclaimable += old.size as u64;
            }
        }
        LogRecordType::TxnFinished => {}
    }
    Ok(())
}

/// Record that the disk index covers the log up to (`file_id`, `offset`)
pub(crate) fn write_checkpoint(dir: &Path, seq_no: u64, file_id: u32, offset: u64) -> Result<()> {
    let checkpoint = IndexCheckpoint {
        seq_no,
        file_id,
        offset,
    };
    let bytes = bincode::serialize(&checkpoint)?;

    let tmp_path = dir.join(format!("{CHECKPOINT_FILE_NAME}.tmp"));
    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp_path, dir.join(CHECKPOINT_FILE_NAME))?;

    debug!(?checkpoint, "index checkpoint written");
    Ok(())
}

/// Read and remove the checkpoint
///
/// Removal happens before any new write, so a crash in this session forces a
/// full rebuild on the next open.
fn take_checkpoint(dir: &Path) -> Result<Option<IndexCheckpoint>> {
    let path = dir.join(CHECKPOINT_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(&path)?;
    fs::remove_file(&path)?;

    match bincode::deserialize(&bytes) {
        Ok(checkpoint) => Ok(Some(checkpoint)),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable index checkpoint");
            Ok(None)
        }
    }
}
