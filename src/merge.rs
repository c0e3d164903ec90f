//! Merge (log compaction)
//!
//! Rewrites every live record of the sealed segments into a fresh set of
//! segments and swaps them in, dropping superseded values and tombstones.
//!
//! ## Merge Process
//! ```text
//! 1. seal      (write lock)  rotate active; ids < non_merge_file_id are immutable
//! 2. copy      (no lock)     live records → <dir>-merge/000000000.data, ...
//!                            key → new position → <dir>-merge/hint-index
//! 3. finish                  sync, then write <dir>-merge/merge-finished
//! 4. swap      (write lock)  move merged files over the old ones,
//!                            repoint the index at the merged positions
//! ```
//!
//! ## Crash Safety
//! `merge-finished` is written last. A merge directory without it is
//! discarded on open; one with it is swapped in on open. Every swap step can
//! be repeated, so a crash in the middle of a swap is finished by the next
//! open.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::{
    list_segment_ids, log_record_key_with_seq, segment_path, LogRecord, LogRecordPos,
    LogRecordType, SegmentFile, HINT_FILE_NAME, NON_TXN_SEQ_NO,
};
use crate::engine::EngineInner;
use crate::error::{CaskError, Result};
use crate::index::Indexer;

/// Marker file: its presence means the merge output is complete
pub const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";

/// Contents of `merge-finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MergeManifest {
    /// First segment id not covered by the merge
    pub(crate) non_merge_file_id: u32,

    /// Merged segments are numbered `0..merged_file_count`
    pub(crate) merged_file_count: u32,
}

impl MergeManifest {
    fn write(&self, dir: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        let mut file = File::create(dir.join(MERGE_FINISHED_FILE_NAME))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn read(path: &Path) -> Result<Self> {
        Ok(bincode::deserialize(&fs::read(path)?)?)
    }
}

/// Working directory of a merge: a sibling of the data directory
pub fn merge_dir_path(dir: &Path) -> PathBuf {
    match dir.file_name() {
        Some(name) => dir.with_file_name(format!("{}-merge", name.to_string_lossy())),
        None => dir.join("merge"),
    }
}

/// Resets the merging flag when a merge ends, however it ends
struct MergingGuard<'a>(&'a AtomicBool);

impl Drop for MergingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EngineInner {
    pub(crate) fn merge(&self) -> Result<()> {
        if self
            .merging
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaskError::MergeInProgress);
        }
        let _merging = MergingGuard(&self.merging);

        // Step 1: Seal the active segment
        let (non_merge_file_id, merge_file_ids, reclaimable_at_seal) = {
            let _write_guard = self.write_lock.lock();
            {
                let segments = self.segments.read();
                if segments.older.is_empty() && segments.active.write_offset() == 0 {
                    debug!("nothing to merge");
                    return Ok(());
                }
            }
            self.rotate_active()?;

            let segments = self.segments.read();
            (
                segments.active.file_id(),
                segments.older.keys().copied().collect::<Vec<_>>(),
                self.reclaimable.load(Ordering::Acquire),
            )
        };
        info!(
            non_merge_file_id,
            segments = merge_file_ids.len(),
            reclaimable = reclaimable_at_seal,
            "merge started"
        );

        // Step 2: Copy live records
        let dir = self.config.data_dir.as_path();
        let merge_dir = merge_dir_path(dir);
        if merge_dir.exists() {
            fs::remove_dir_all(&merge_dir)?;
        }
        fs::create_dir_all(&merge_dir)?;

        let mut output = MergeOutput::create(
            &merge_dir,
            self.config.max_active_file_size,
            non_merge_file_id,
        )?;
        let hint = SegmentFile::open_hint(&merge_dir)?;
        let mut relocated = Vec::new();

        let mut iter = self.index_iterator(false);
        while let (Some(key), Some(old_pos)) = (iter.key(), iter.pos()) {
            if old_pos.file_id < non_merge_file_id {
                let value = {
                    let segments = self.segments.read();
                    self.value_at(&segments, old_pos)?
                };
                let record = LogRecord::normal(log_record_key_with_seq(key, NON_TXN_SEQ_NO), value);
                let new_pos = output.append(&record)?;
                hint.write_hint(key, new_pos)?;
                relocated.push((key.to_vec(), old_pos, new_pos));
            }
            iter.advance();
        }
        iter.close();

        // Step 3: Make the output durable, then mark it complete
        output.sync()?;
        hint.sync()?;
        let manifest = MergeManifest {
            non_merge_file_id,
            merged_file_count: output.file_count(),
        };
        drop(output);
        drop(hint);
        manifest.write(&merge_dir)?;

        // Step 4: Swap
        let _write_guard = self.write_lock.lock();
        let mut segments = self.segments.write();
        for file_id in &merge_file_ids {
            segments.older.remove(file_id);
        }
        apply_merge_dir(dir, &merge_dir)?;
        for file_id in 0..manifest.merged_file_count {
            segments.older.insert(file_id, SegmentFile::open(dir, file_id)?);
        }

        // A key rewritten during the copy keeps its newer position
        let mut repointed = 0usize;
        for (key, old_pos, new_pos) in relocated {
            if self.index.get(&key) == Some(old_pos) {
                self.index.put(key, new_pos)?;
                repointed += 1;
            }
        }
        drop(segments);

        let _ = self
            .reclaimable
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(reclaimable_at_seal))
            });

        info!(
            merged_files = manifest.merged_file_count,
            removed_files = merge_file_ids.len(),
            keys = repointed,
            "merge finished"
        );
        Ok(())
    }
}

/// Writer for the merged segments, numbered from 0
struct MergeOutput {
    dir: PathBuf,
    max_file_size: u64,
    /// Merged ids must stay below this
    limit: u32,
    active: SegmentFile,
}

impl MergeOutput {
    fn create(dir: &Path, max_file_size: u64, limit: u32) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            limit,
            active: SegmentFile::open(dir, 0)?,
        })
    }

    fn append(&mut self, record: &LogRecord) -> Result<LogRecordPos> {
        if self.active.write_offset() >= self.max_file_size {
            self.rotate()?;
        }

        let encoded = record.encode();
        let offset = self.active.append(&encoded)?;
        Ok(LogRecordPos {
            file_id: self.active.file_id(),
            offset,
            size: encoded.len() as u32,
        })
    }

    fn rotate(&mut self) -> Result<()> {
        let next_id = self.active.file_id() + 1;
        if next_id >= self.limit {
            return Err(CaskError::MergeOverflow { file_id: next_id });
        }
        self.active.sync()?;
        self.active = SegmentFile::open(&self.dir, next_id)?;
        Ok(())
    }

    /// Number of merged segments holding data
    fn file_count(&self) -> u32 {
        if self.active.write_offset() == 0 {
            self.active.file_id()
        } else {
            self.active.file_id() + 1
        }
    }

    fn sync(&self) -> Result<()> {
        self.active.sync()
    }
}

/// Move a completed merge from `merge_dir` into `dir`
///
/// Returns `None` when `merge_dir` holds no completed merge. Safe to call
/// again after a crash part way through.
fn apply_merge_dir(dir: &Path, merge_dir: &Path) -> Result<Option<MergeManifest>> {
    let marker = merge_dir.join(MERGE_FINISHED_FILE_NAME);
    if !marker.exists() {
        return Ok(None);
    }
    let manifest = MergeManifest::read(&marker)?;

    for file_id in 0..manifest.merged_file_count {
        let merged = segment_path(merge_dir, file_id);
        if merged.exists() {
            fs::rename(&merged, segment_path(dir, file_id))?;
        }
    }
    for file_id in list_segment_ids(dir)? {
        if file_id >= manifest.merged_file_count && file_id < manifest.non_merge_file_id {
            fs::remove_file(segment_path(dir, file_id))?;
        }
    }

    let hint = merge_dir.join(HINT_FILE_NAME);
    if hint.exists() {
        fs::rename(&hint, dir.join(HINT_FILE_NAME))?;
    }
    sync_dir(dir)?;

    fs::rename(&marker, dir.join(MERGE_FINISHED_FILE_NAME))?;
    sync_dir(dir)?;
    fs::remove_dir_all(merge_dir)?;

    Ok(Some(manifest))
}

/// Finish or discard a merge left behind by a previous process
///
/// Returns true if a completed merge was swapped in.
pub(crate) fn finish_pending_merge(dir: &Path) -> Result<bool> {
    let merge_dir = merge_dir_path(dir);
    if !merge_dir.is_dir() {
        return Ok(false);
    }

    match apply_merge_dir(dir, &merge_dir)? {
        Some(manifest) => {
            info!(?manifest, "completed interrupted merge");
            Ok(true)
        }
        None => {
            warn!(dir = %merge_dir.display(), "discarding incomplete merge");
            fs::remove_dir_all(&merge_dir)?;
            Ok(false)
        }
    }
}

/// Load the hint file of the last merge into `index`
///
/// Returns the first segment id the hints do not cover, or `None` if the
/// directory has never been merged.
pub(crate) fn load_hint_index(dir: &Path, index: &dyn Indexer) -> Result<Option<u32>> {
    let marker = dir.join(MERGE_FINISHED_FILE_NAME);
    if !marker.exists() {
        return Ok(None);
    }
    let manifest = MergeManifest::read(&marker)?;

    if dir.join(HINT_FILE_NAME).exists() {
        let hint = SegmentFile::open_hint(dir)?;
        let mut offset = 0u64;
        let mut loaded = 0usize;

        loop {
            let (record, size) = match hint.read_record(offset) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(CaskError::CorruptRecord { .. }) => {
                    return Err(CaskError::DirectoryCorrupted {
                        file_id: hint.file_id(),
                        offset,
                    })
                }
                Err(e) => return Err(e),
            };
            if record.rec_type == LogRecordType::Normal {
                let pos = LogRecordPos::decode(&record.value).map_err(|source| {
                    CaskError::CorruptRecord {
                        file_id: hint.file_id(),
                        offset,
                        source,
                    }
                })?;
                index.put(record.key, pos)?;
                loaded += 1;
            }
            offset += size as u64;
        }
        debug!(keys = loaded, "hint file loaded");
    }

    Ok(Some(manifest.non_merge_file_id))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

// =============================================================================
// Background Merge Worker
// =============================================================================

/// Thread that runs merges requested by the engine
///
/// Requests go through a bounded channel of one slot, so a burst of writes
/// schedules at most one pending merge.
pub(crate) struct MergeWorker {
    trigger: Sender<()>,
    handle: JoinHandle<()>,
}

impl MergeWorker {
    pub(crate) fn spawn(engine: &Arc<EngineInner>) -> Result<Self> {
        let (trigger, requests) = channel::bounded::<()>(1);
        let engine: Weak<EngineInner> = Arc::downgrade(engine);

        let handle = thread::Builder::new()
            .name("caskdb-merge".to_string())
            .spawn(move || {
                for () in requests.iter() {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    match engine.merge() {
                        Ok(()) | Err(CaskError::MergeInProgress) => {}
                        Err(e) => warn!(error = %e, "background merge failed"),
                    }
                }
                debug!("merge worker stopped");
            })?;

        Ok(Self { trigger, handle })
    }

    /// Ask for a merge; dropped if one is already queued
    pub(crate) fn request(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop accepting requests and wait for a running merge to finish
    pub(crate) fn shutdown(self) {
        drop(self.trigger);
        if self.handle.join().is_err() {
            warn!("merge worker panicked");
        }
    }
}

