//! Disk-resident ordered index
//!
//! Persists the key → position map in its own journal so the engine does not
//! need to replay the whole log on open.
//!
//! ## Journal Format
//! The journal reuses the log record frame: a `Normal` record whose value is
//! an encoded [`LogRecordPos`] for puts, a `Deleted` record for removals. Each
//! append is one committed transaction; it is written (and synced when the
//! engine syncs writes) before the mutation becomes visible.
//!
//! ## Read Versions
//! Lookups are served from an in-memory `BTreeMap` that mirrors the journal.
//! An iterator copies the entries out once when it is opened and holds that
//! read version until closed; writers keep mutating the map in place. Journal
//! compaction is skipped while any iterator is open: long-lived iterators
//! block space reclamation.
//!
//! ## Rebuilds
//! While the engine replays the log into an empty index, per-mutation syncs
//! are deferred and the journal is synced once at the end.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::data::{LogRecord, LogRecordPos, LogRecordType, SegmentFile};
use crate::error::{CaskError, Result};

use super::btree::BTreeIndexIterator;
use super::{IndexIterator, Indexer};

/// Journal file name inside the data directory
pub const DISK_INDEX_FILE_NAME: &str = "disk-index";

/// Stale journal entries tolerated before a compaction is considered
const COMPACT_MIN_STALE: usize = 1024;

/// Ordered key → position map persisted in a journal
pub struct DiskIndex {
    path: PathBuf,
    sync_writes: bool,
    /// Skip per-mutation syncs (bulk rebuild)
    deferred_sync: AtomicBool,
    /// Journal fsyncs performed
    syncs: AtomicU64,
    state: RwLock<JournalState>,
    /// Iterators currently pinning a read version
    open_readers: Arc<AtomicUsize>,
}

struct JournalState {
    tree: BTreeMap<Vec<u8>, LogRecordPos>,
    journal: SegmentFile,
    /// Journal entries that no longer describe a live key
    stale: usize,
}

impl DiskIndex {
    /// Open the journal in `dir`, loading every committed mutation
    pub fn open(dir: &Path, sync_writes: bool) -> Result<Self> {
        let path = dir.join(DISK_INDEX_FILE_NAME);
        let journal = SegmentFile::open_path(path.clone(), 0)?;
        let (tree, stale) = load_journal(&journal)?;

        debug!(keys = tree.len(), stale, "disk index loaded");

        Ok(Self {
            path,
            sync_writes,
            deferred_sync: AtomicBool::new(false),
            syncs: AtomicU64::new(0),
            state: RwLock::new(JournalState {
                tree,
                journal,
                stale,
            }),
            open_readers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of iterators holding a read version
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::Acquire)
    }

    /// Number of journal fsyncs so far
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Acquire)
    }

    fn commit(&self, journal: &SegmentFile, record: &LogRecord) -> Result<()> {
        journal
            .append(&record.encode())
            .map_err(|e| CaskError::IndexUpdateFailed(e.to_string()))?;
        if self.sync_writes && !self.deferred_sync.load(Ordering::Acquire) {
            self.sync_journal(journal)
                .map_err(|e| CaskError::IndexUpdateFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn sync_journal(&self, journal: &SegmentFile) -> Result<()> {
        journal.sync()?;
        self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn maybe_compact(&self, state: &mut JournalState) {
        if state.stale < COMPACT_MIN_STALE || state.stale <= state.tree.len() {
            return;
        }
        if self.open_readers() > 0 {
            return;
        }
        // The mutation that triggered this is already committed
        if let Err(e) = self.rewrite(state) {
            warn!(error = %e, "disk index compaction failed");
        }
    }

    /// Replace the journal with one entry per live key
    fn rewrite(&self, state: &mut JournalState) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        {
            let out = SegmentFile::open_path(tmp_path.clone(), 0)?;
            for (key, pos) in state.tree.iter() {
                out.append(&LogRecord::normal(key.clone(), pos.encode()).encode())?;
            }
            out.sync()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        state.journal = SegmentFile::open_path(self.path.clone(), 0)?;
        debug!(live = state.tree.len(), dropped = state.stale, "disk index compacted");
        state.stale = 0;
        Ok(())
    }
}

/// Replay the journal; a corrupt tail is cut off
fn load_journal(journal: &SegmentFile) -> Result<(BTreeMap<Vec<u8>, LogRecordPos>, usize)> {
    let mut tree = BTreeMap::new();
    let mut stale = 0;
    let mut offset = 0u64;

    loop {
        let (record, size) = match journal.read_record(offset) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(CaskError::CorruptRecord { source, .. }) => {
                warn!(offset, error = %source, "dropping corrupt disk index tail");
                journal.truncate(offset)?;
                break;
            }
            Err(e) => return Err(e),
        };

        match record.rec_type {
            LogRecordType::Normal => {
                let Ok(pos) = LogRecordPos::decode(&record.value) else {
                    warn!(offset, "dropping disk index tail with undecodable position");
                    journal.truncate(offset)?;
                    break;
                };
                if tree.insert(record.key, pos).is_some() {
                    stale += 1;
                }
            }
            LogRecordType::Deleted => {
                stale += if tree.remove(&record.key).is_some() { 2 } else { 1 };
            }
            LogRecordType::TxnFinished => stale += 1,
        }
        offset += size as u64;
    }

    Ok((tree, stale))
}

impl Indexer for DiskIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
        let mut state = self.state.write();
        self.commit(&state.journal, &LogRecord::normal(key.clone(), pos.encode()))?;

        let old = state.tree.insert(key, pos);
        if old.is_some() {
            state.stale += 1;
        }
        self.maybe_compact(&mut state);
        Ok(old)
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.state.read().tree.get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        let mut state = self.state.write();
        if !state.tree.contains_key(key) {
            return Ok(None);
        }
        self.commit(&state.journal, &LogRecord::deleted(key.to_vec()))?;

        let old = state.tree.remove(key);
        state.stale += 2;
        self.maybe_compact(&mut state);
        Ok(old)
    }

    fn size(&self) -> usize {
        self.state.read().tree.len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let state = self.state.read();
        self.open_readers.fetch_add(1, Ordering::AcqRel);

        Box::new(DiskIndexIterator {
            version: BTreeIndexIterator::snapshot(&state.tree, reverse),
            readers: Some(Arc::clone(&self.open_readers)),
        })
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        state
            .journal
            .truncate(0)
            .map_err(|e| CaskError::IndexUpdateFailed(e.to_string()))?;
        state.tree = BTreeMap::new();
        state.stale = 0;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.sync_journal(&self.state.read().journal)
    }

    fn set_deferred_sync(&self, deferred: bool) {
        self.deferred_sync.store(deferred, Ordering::Release);
    }
}

/// Cursor over a read version of a [`DiskIndex`]
///
/// Counts as an open reader until closed or dropped.
pub struct DiskIndexIterator {
    version: BTreeIndexIterator,
    readers: Option<Arc<AtomicUsize>>,
}

impl IndexIterator for DiskIndexIterator {
    fn rewind(&mut self) {
        self.version.rewind();
    }

    fn seek(&mut self, key: &[u8]) {
        self.version.seek(key);
    }

    fn advance(&mut self) {
        self.version.advance();
    }

    fn valid(&self) -> bool {
        self.version.valid()
    }

    fn key(&self) -> Option<&[u8]> {
        self.version.key()
    }

    fn pos(&self) -> Option<LogRecordPos> {
        self.version.pos()
    }

    fn close(&mut self) {
        self.version.close();
        if let Some(readers) = self.readers.take() {
            readers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for DiskIndexIterator {
    fn drop(&mut self) {
        self.close();
    }
}
