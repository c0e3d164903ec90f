//! Index Module
//!
//! Maps user keys to the position of their latest committed record.
//!
//! ## Responsibilities
//! - Point lookups for `get`
//! - Ordered, optionally reversed, seekable iteration for scans and merge
//! - Concurrent readers; a mutation is never observed half-applied
//!
//! ## Backends
//! - [`BTreeIndex`]: ordered in-memory map behind a RwLock, rebuilt from the
//!   log on every open. Iterators take a point-in-time snapshot.
//! - [`DiskIndex`]: ordered map persisted in its own journal. Every mutation
//!   is committed to the journal before it becomes visible; iterators hold a
//!   copied read version until closed.
//!
//! Deleted keys are removed from the index. Tombstones only live in the log.

mod btree;
mod disk;

use std::path::Path;

pub use btree::BTreeIndex;
pub use disk::{DiskIndex, DISK_INDEX_FILE_NAME};

use crate::config::IndexBackend;
use crate::data::LogRecordPos;
use crate::error::Result;

/// Capability set shared by every index backend
pub trait Indexer: Send + Sync {
    /// Insert or replace, returning the previous position
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>>;

    /// Position of `key`, if present
    fn get(&self, key: &[u8]) -> Option<LogRecordPos>;

    /// Remove `key`, returning the removed position
    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>>;

    /// Number of keys
    fn size(&self) -> usize;

    /// Ordered cursor over all keys
    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator>;

    /// Drop every entry (used before a full rebuild)
    fn clear(&self) -> Result<()>;

    /// Flush backend state to stable storage
    fn sync(&self) -> Result<()>;

    /// Hold back per-mutation durability during a bulk rebuild
    ///
    /// The caller syncs once the rebuild is done.
    fn set_deferred_sync(&self, _deferred: bool) {}
}

/// Ordered cursor over an index
///
/// Starts positioned at the first key (last key when reversed).
pub trait IndexIterator: Send {
    /// Go back to the first key
    fn rewind(&mut self);

    /// Position at the first key >= `key` (<= `key` when reversed)
    fn seek(&mut self, key: &[u8]);

    /// Move to the next key in iteration order
    fn advance(&mut self);

    /// Whether the cursor points at a key
    fn valid(&self) -> bool;

    /// Current key, `None` once exhausted
    fn key(&self) -> Option<&[u8]>;

    /// Current position, `None` once exhausted
    fn pos(&self) -> Option<LogRecordPos>;

    /// Release snapshot buffers / read versions
    fn close(&mut self);
}

/// Build the backend selected in the config
pub fn new_indexer(
    backend: IndexBackend,
    dir: &Path,
    sync_writes: bool,
) -> Result<Box<dyn Indexer>> {
    match backend {
        IndexBackend::BTree => Ok(Box::new(BTreeIndex::new())),
        IndexBackend::Disk => Ok(Box::new(DiskIndex::open(dir, sync_writes)?)),
    }
}
