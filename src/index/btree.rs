//! In-memory ordered index
//!
//! BTreeMap-based index with RwLock for concurrency.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::data::LogRecordPos;
use crate::error::Result;

use super::{IndexIterator, Indexer};

/// Ordered in-memory key → position map
///
/// ## Concurrency:
/// - Lookups take the read lock, mutations the write lock
/// - `iterator` copies the entries out under the read lock, so later
///   mutations never affect an in-flight iteration
#[derive(Default)]
pub struct BTreeIndex {
    tree: RwLock<BTreeMap<Vec<u8>, LogRecordPos>>,
}

impl BTreeIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Indexer for BTreeIndex {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().insert(key, pos))
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.tree.read().get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> Result<Option<LogRecordPos>> {
        Ok(self.tree.write().remove(key))
    }

    fn size(&self) -> usize {
        self.tree.read().len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        Box::new(BTreeIndexIterator::snapshot(&self.tree.read(), reverse))
    }

    fn clear(&self) -> Result<()> {
        self.tree.write().clear();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Cursor over a point-in-time copy of the index
pub struct BTreeIndexIterator {
    /// Snapshot, already in iteration order
    entries: Vec<(Vec<u8>, LogRecordPos)>,
    cursor: usize,
    reverse: bool,
}

impl BTreeIndexIterator {
    /// Copy `tree` out in iteration order
    pub(super) fn snapshot(tree: &BTreeMap<Vec<u8>, LogRecordPos>, reverse: bool) -> Self {
        let entries: Vec<(Vec<u8>, LogRecordPos)> = if reverse {
            tree.iter().rev().map(|(k, p)| (k.clone(), *p)).collect()
        } else {
            tree.iter().map(|(k, p)| (k.clone(), *p)).collect()
        };

        Self {
            entries,
            cursor: 0,
            reverse,
        }
    }
}

impl IndexIterator for BTreeIndexIterator {
    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn seek(&mut self, key: &[u8]) {
        // Entries are sorted in iteration order, so both directions are a partition point
        self.cursor = if self.reverse {
            self.entries.partition_point(|(k, _)| k.as_slice() > key)
        } else {
            self.entries.partition_point(|(k, _)| k.as_slice() < key)
        };
    }

    fn advance(&mut self) {
        if self.cursor < self.entries.len() {
            self.cursor += 1;
        }
    }

    fn valid(&self) -> bool {
        self.cursor < self.entries.len()
    }

    fn key(&self) -> Option<&[u8]> {
        self.entries.get(self.cursor).map(|(k, _)| k.as_slice())
    }

    fn pos(&self) -> Option<LogRecordPos> {
        self.entries.get(self.cursor).map(|(_, p)| *p)
    }

    fn close(&mut self) {
        self.entries = Vec::new();
        self.cursor = 0;
    }
}
