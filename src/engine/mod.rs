//! Engine Module
//!
//! The core storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Own the active segment, the sealed segments, and the index
//! - Append mutations and keep the index pointing at the latest record
//! - Rotate the active segment once it crosses the size threshold
//! - Recover the index from the log on startup
//! - Hold the single-writer directory lock while open

mod iterator;
mod lock;
mod recovery;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::batch::WriteBatch;
use crate::config::{Config, IndexBackend, IteratorOptions, SyncStrategy, WriteBatchOptions};
use crate::data::{
    list_segment_ids, log_record_key_with_seq, DecodeError, LogRecord, LogRecordPos,
    LogRecordType, SegmentFile, NON_TXN_SEQ_NO,
};
use crate::error::{CaskError, Result};
use crate::index::{new_indexer, IndexIterator, Indexer};
use crate::merge::{self, MergeWorker};

pub use iterator::EngineIterator;
pub use lock::LOCK_FILE_NAME;
pub use recovery::CHECKPOINT_FILE_NAME;

use lock::DirLock;

/// Engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Number of live keys
    pub key_num: usize,
    /// Number of segment files, active included
    pub data_file_num: usize,
    /// Bytes held by superseded records, tombstones and batch markers
    pub reclaimable_size: u64,
    /// Bytes used by the data directory
    pub disk_size: u64,
}

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete/batch commit): Serialized by `write_lock`
///   - Only ONE write operation at a time
///   - Must acquire: write_lock → segments → index
///
/// - **Reads** (get/iterate): Never take `write_lock`
///   - Hold the `segments` read lock across the index lookup and the file read,
///     so a merge swap can never invalidate a resolved position mid-read
///   - Batch commits update the index under the `segments` write lock, so a
///     lookup or a new iterator sees all of a batch or none of it
///   - Appends only extend a file, so reading the active segment is safe
///
/// - **Merge**: copies live records without `write_lock`; takes it only to
///   seal the active segment and to swap the merged files in
pub struct Engine {
    inner: Arc<EngineInner>,

    /// Background merge thread (only when `auto_merge` is enabled)
    merge_worker: Mutex<Option<MergeWorker>>,
}

/// State shared with the background merge thread
pub(crate) struct EngineInner {
    pub(crate) config: Config,

    /// Active + sealed segments
    pub(crate) segments: RwLock<Segments>,

    /// Key → latest record position
    pub(crate) index: Box<dyn Indexer>,

    /// Serializes write operations (put/delete/commit/seal/swap)
    pub(crate) write_lock: Mutex<()>,

    /// Last write batch sequence number handed out
    pub(crate) seq_no: AtomicU64,

    /// Set while a merge runs
    pub(crate) merging: AtomicBool,

    /// Bytes that a merge would reclaim
    pub(crate) reclaimable: AtomicU64,

    /// Bytes appended since the active segment was last synced
    unsynced_bytes: AtomicU64,

    _lock: DirLock,
}

/// Open segment files
pub(crate) struct Segments {
    /// The only segment accepting appends (highest id)
    pub(crate) active: SegmentFile,

    /// Sealed, read-only segments by id
    pub(crate) older: BTreeMap<u32, SegmentFile>,
}

impl Segments {
    pub(crate) fn get(&self, file_id: u32) -> Option<&SegmentFile> {
        if self.active.file_id() == file_id {
            Some(&self.active)
        } else {
            self.older.get(&file_id)
        }
    }

    /// Every segment in ascending id order
    pub(crate) fn iter(&self) -> impl Iterator<Item = &SegmentFile> {
        self.older.values().chain(std::iter::once(&self.active))
    }

    /// Total bytes across all segments
    pub(crate) fn log_size(&self) -> u64 {
        self.iter().map(SegmentFile::write_offset).sum()
    }

    pub(crate) fn count(&self) -> usize {
        self.older.len() + 1
    }
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate the config and create the data directory
    /// 2. Take the directory lock
    /// 3. Finish or discard a merge interrupted by a crash
    /// 4. Open every segment; the newest becomes the active one
    /// 5. Rebuild the index (hint file + log replay)
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let dir_lock = DirLock::acquire(&config.data_dir)?;
        debug!(lock = ?dir_lock.path(), "acquired directory lock");

        let merge_applied = merge::finish_pending_merge(&config.data_dir)?;

        let index = new_indexer(
            config.index_backend,
            &config.data_dir,
            config.sync_strategy == SyncStrategy::EveryWrite,
        )?;
        let segments = open_segments(&config.data_dir)?;

        let recovered = recovery::recover(&config, &segments, index.as_ref(), merge_applied)?;
        info!(
            dir = %config.data_dir.display(),
            segments = segments.count(),
            keys = index.size(),
            records = recovered.records_replayed,
            discarded_batches = recovered.batches_discarded,
            "engine opened"
        );

        let inner = Arc::new(EngineInner {
            config,
            segments: RwLock::new(segments),
            index,
            write_lock: Mutex::new(()),
            seq_no: AtomicU64::new(recovered.seq_no),
            merging: AtomicBool::new(false),
            reclaimable: AtomicU64::new(recovered.reclaimable),
            unsynced_bytes: AtomicU64::new(0),
            _lock: dir_lock,
        });

        let merge_worker = if inner.config.auto_merge {
            Some(MergeWorker::spawn(&inner)?)
        } else {
            None
        };

        Ok(Self {
            inner,
            merge_worker: Mutex::new(merge_worker),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().data_dir(path).build();
        Self::open(config)
    }

    /// Get the value of `key`
    ///
    /// Fails with `KeyNotFound` when the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.get(key)
    }

    /// Put a key-value pair
    ///
    /// Steps:
    /// 1. Acquire write lock
    /// 2. Append a Normal record to the active segment (rotating if full)
    /// 3. Sync per the sync strategy
    /// 4. Point the index at the new record
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)?;
        self.maybe_schedule_merge();
        Ok(())
    }

    /// Delete a key
    ///
    /// Deleting an absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)?;
        self.maybe_schedule_merge();
        Ok(())
    }

    /// Start a write batch whose mutations become visible together on commit
    pub fn new_write_batch(&self, options: WriteBatchOptions) -> WriteBatch<'_> {
        WriteBatch::new(self, options)
    }

    /// Ordered cursor over keys (and lazily read values)
    pub fn iter(&self, options: IteratorOptions) -> EngineIterator<'_> {
        EngineIterator::new(&self.inner, options)
    }

    /// All keys in ascending order
    pub fn list_keys(&self) -> Vec<Vec<u8>> {
        let mut iter = self.inner.index_iterator(false);
        let mut keys = Vec::with_capacity(self.inner.index.size());
        while let Some(key) = iter.key() {
            keys.push(key.to_vec());
            iter.advance();
        }
        iter.close();
        keys
    }

    /// Visit every key/value pair in key order until `visit` returns false
    ///
    /// Keys deleted after the traversal started are skipped.
    pub fn fold<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut iter = self.inner.index_iterator(false);
        while let Some(key) = iter.key().map(<[u8]>::to_vec) {
            match self.inner.get(&key) {
                Ok(value) => {
                    if !visit(&key, &value) {
                        break;
                    }
                }
                Err(CaskError::KeyNotFound) => {}
                Err(e) => {
                    iter.close();
                    return Err(e);
                }
            }
            iter.advance();
        }
        iter.close();
        Ok(())
    }

    /// Rewrite live records into compact segments and drop the rest
    pub fn merge(&self) -> Result<()> {
        self.inner.merge()
    }

    /// Force the active segment and index to stable storage
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Key count, file count and space accounting
    pub fn stat(&self) -> Result<Stat> {
        let segments = self.inner.segments.read();
        Ok(Stat {
            key_num: self.inner.index.size(),
            data_file_num: segments.count(),
            reclaimable_size: self.inner.reclaimable.load(Ordering::Acquire),
            disk_size: dir_size(&self.inner.config.data_dir)?,
        })
    }

    /// Copy the database files into `dest`, which can then be opened on its own
    pub fn backup(&self, dest: &Path) -> Result<()> {
        self.inner.backup(dest)
    }

    /// Close the engine gracefully
    ///
    /// Stops the merge worker, syncs the active segment and index, and
    /// releases the directory lock.
    pub fn close(self) -> Result<()> {
        self.stop_merge_worker();
        self.inner.close()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.inner.config.data_dir
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Id of the segment currently accepting appends
    pub fn active_file_id(&self) -> u32 {
        self.inner.segments.read().active.file_id()
    }

    /// Ids of every open segment, ascending
    pub fn file_ids(&self) -> Vec<u32> {
        self.inner
            .segments
            .read()
            .iter()
            .map(SegmentFile::file_id)
            .collect()
    }

    /// Last write batch sequence number
    pub fn seq_no(&self) -> u64 {
        self.inner.seq_no.load(Ordering::Acquire)
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.inner
    }

    pub(crate) fn maybe_schedule_merge(&self) {
        if let Some(worker) = self.merge_worker.lock().as_ref() {
            if !self.inner.merging.load(Ordering::Acquire) && self.inner.merge_ratio_reached() {
                worker.request();
            }
        }
    }

    fn stop_merge_worker(&self) {
        if let Some(worker) = self.merge_worker.lock().take() {
            worker.shutdown();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_merge_worker();
    }
}

impl EngineInner {
    pub(crate) fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }

        let segments = self.segments.read();
        let pos = self.index.get(key).ok_or(CaskError::KeyNotFound)?;
        self.value_at(&segments, pos)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }
        let record = LogRecord::normal(log_record_key_with_seq(key, NON_TXN_SEQ_NO), value.to_vec());

        let _write_guard = self.write_lock.lock();
        let pos = self.append_log_record(&record)?;
        self.sync_after_write(false)?;
        self.apply_to_index(key.to_vec(), LogRecordType::Normal, pos)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }

        let _write_guard = self.write_lock.lock();
        if self.index.get(key).is_none() {
            return Ok(());
        }

        let record = LogRecord::deleted(log_record_key_with_seq(key, NON_TXN_SEQ_NO));
        let pos = self.append_log_record(&record)?;
        self.sync_after_write(false)?;
        self.apply_to_index(key.to_vec(), LogRecordType::Deleted, pos)
    }

    /// Ordered index cursor that never sees half of a committed batch
    ///
    /// Batch commits apply their mutations while holding the segments write
    /// lock, so opening the cursor under the read lock lands between batches.
    pub(crate) fn index_iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let _segments = self.segments.read();
        self.index.iterator(reverse)
    }

    /// Read the value stored at `pos`
    pub(crate) fn value_at(&self, segments: &Segments, pos: LogRecordPos) -> Result<Vec<u8>> {
        let segment = segments.get(pos.file_id).ok_or(CaskError::DataFileMissing {
            file_id: pos.file_id,
        })?;
        let (record, _) = segment
            .read_record(pos.offset)?
            .ok_or(CaskError::CorruptRecord {
                file_id: pos.file_id,
                offset: pos.offset,
                source: DecodeError::Truncated,
            })?;

        match record.rec_type {
            LogRecordType::Normal => Ok(record.value),
            _ => Err(CaskError::KeyNotFound),
        }
    }

    /// Append to the active segment, rotating it once it reaches the size limit
    ///
    /// Caller must hold `write_lock`.
    pub(crate) fn append_log_record(&self, record: &LogRecord) -> Result<LogRecordPos> {
        let encoded = record.encode();

        let (pos, full) = {
            let segments = self.segments.read();
            let offset = segments.active.append(&encoded)?;
            let pos = LogRecordPos {
                file_id: segments.active.file_id(),
                offset,
                size: encoded.len() as u32,
            };
            (
                pos,
                segments.active.write_offset() >= self.config.max_active_file_size,
            )
        };
        self.unsynced_bytes
            .fetch_add(encoded.len() as u64, Ordering::AcqRel);

        if full {
            self.rotate_active()?;
        }
        Ok(pos)
    }

    /// Seal the active segment and open `active_id + 1`
    ///
    /// Caller must hold `write_lock`.
    pub(crate) fn rotate_active(&self) -> Result<()> {
        let mut segments = self.segments.write();
        segments.active.sync()?;

        let next_id = segments.active.file_id() + 1;
        let next = SegmentFile::open(&self.config.data_dir, next_id)?;
        let sealed = std::mem::replace(&mut segments.active, next);
        info!(sealed = sealed.file_id(), active = next_id, "rotated active segment");

        segments.older.insert(sealed.file_id(), sealed);
        self.unsynced_bytes.store(0, Ordering::Release);
        Ok(())
    }

    /// Sync the active segment if `force` is set or the strategy says so
    pub(crate) fn sync_after_write(&self, force: bool) -> Result<()> {
        let due = force
            || match self.config.sync_strategy {
                SyncStrategy::EveryWrite => true,
                SyncStrategy::EveryNBytes { bytes } => {
                    self.unsynced_bytes.load(Ordering::Acquire) >= bytes
                }
                SyncStrategy::Never => false,
            };

        if due {
            self.segments.read().active.sync()?;
            self.unsynced_bytes.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Make a logged mutation visible and account for the space it frees
    pub(crate) fn apply_to_index(
        &self,
        key: Vec<u8>,
        rec_type: LogRecordType,
        pos: LogRecordPos,
    ) -> Result<()> {
        match rec_type {
            LogRecordType::Normal => {
                if let Some(old) = self.index.put(key, pos)? {
                    self.add_reclaimable(old.size);
                }
            }
            LogRecordType::Deleted => {
                self.add_reclaimable(pos.size);
                if let Some(old) = self.index.delete(&key)? {
                    self.add_reclaimable(old.size);
                }
            }
            LogRecordType::TxnFinished => self.add_reclaimable(pos.size),
        }
        Ok(())
    }

    pub(crate) fn add_reclaimable(&self, size: u32) {
        self.reclaimable.fetch_add(size as u64, Ordering::AcqRel);
    }

    /// Whether reclaimable bytes reached `merge_ratio_threshold` of the log
    pub(crate) fn merge_ratio_reached(&self) -> bool {
        let reclaimable = self.reclaimable.load(Ordering::Acquire);
        if reclaimable == 0 {
            return false;
        }
        let total = self.segments.read().log_size();
        total > 0 && reclaimable as f64 / total as f64 >= self.config.merge_ratio_threshold as f64
    }

    fn sync(&self) -> Result<()> {
        self.segments.read().active.sync()?;
        self.unsynced_bytes.store(0, Ordering::Release);
        self.index.sync()
    }

    fn backup(&self, dest: &Path) -> Result<()> {
        // No writes or merge swaps while files are copied
        let _write_guard = self.write_lock.lock();
        let segments = self.segments.read();
        segments.active.sync()?;
        self.index.sync()?;

        fs::create_dir_all(dest)?;
        let mut copied = 0usize;
        for entry in fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || entry.file_name() == LOCK_FILE_NAME {
                continue;
            }
            fs::copy(&path, dest.join(entry.file_name()))?;
            copied += 1;
        }

        info!(dest = %dest.display(), files = copied, "backup finished");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        let segments = self.segments.read();
        segments.active.sync()?;
        self.index.sync()?;

        if self.config.index_backend == IndexBackend::Disk {
            recovery::write_checkpoint(
                &self.config.data_dir,
                self.seq_no.load(Ordering::Acquire),
                segments.active.file_id(),
                segments.active.write_offset(),
            )?;
        }

        info!(dir = %self.config.data_dir.display(), "engine closed");
        Ok(())
    }
}

/// Open every segment in `dir`; the highest id becomes active
fn open_segments(dir: &Path) -> Result<Segments> {
    let mut ids = list_segment_ids(dir)?;
    let active_id = ids.pop().unwrap_or(0);

    let mut older = BTreeMap::new();
    for id in ids {
        older.insert(id, SegmentFile::open(dir, id)?);
    }

    Ok(Segments {
        active: SegmentFile::open(dir, active_id)?,
        older,
    })
}

/// Total size of the regular files in `dir`
fn dir_size(dir: &Path) -> Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            size += metadata.len();
        }
    }
    Ok(size)
}
