//! Engine iterator
//!
//! Walks the index in key order and reads values from the log on demand.

use crate::config::IteratorOptions;
use crate::error::{CaskError, Result};
use crate::index::IndexIterator;

use super::EngineInner;

/// Ordered cursor over the engine's keys
///
/// Keys come from the index iterator taken at creation. Values are looked up
/// through the live index when asked for, so a key deleted after creation
/// yields `KeyNotFound` from [`value`](Self::value).
pub struct EngineIterator<'a> {
    engine: &'a EngineInner,
    index_iter: Box<dyn IndexIterator>,
    options: IteratorOptions,
}

impl<'a> EngineIterator<'a> {
    pub(crate) fn new(engine: &'a EngineInner, options: IteratorOptions) -> Self {
        let index_iter = engine.index_iterator(options.reverse);
        let mut iter = Self {
            engine,
            index_iter,
            options,
        };
        iter.skip_to_prefix();
        iter
    }

    /// Go back to the first matching key
    pub fn rewind(&mut self) {
        self.index_iter.rewind();
        self.skip_to_prefix();
    }

    /// Position at the first matching key >= `key` (<= `key` when reversed)
    pub fn seek(&mut self, key: &[u8]) {
        self.index_iter.seek(key);
        self.skip_to_prefix();
    }

    /// Move to the next matching key
    pub fn advance(&mut self) {
        self.index_iter.advance();
        self.skip_to_prefix();
    }

    pub fn valid(&self) -> bool {
        self.index_iter.valid()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.index_iter.key()
    }

    /// Read the value of the current key
    pub fn value(&self) -> Result<Vec<u8>> {
        let key = self.key().ok_or(CaskError::KeyNotFound)?;
        self.engine.get(key)
    }

    /// Release the underlying index snapshot
    pub fn close(&mut self) {
        self.index_iter.close();
    }

    fn skip_to_prefix(&mut self) {
        if self.options.prefix.is_empty() {
            return;
        }
        while let Some(key) = self.index_iter.key() {
            if key.starts_with(&self.options.prefix) {
                break;
            }
            self.index_iter.advance();
        }
    }
}

impl Iterator for EngineIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    /// Yield the current pair and advance; keys deleted meanwhile are skipped
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.key()?.to_vec();
            let value = self.engine.get(&key);
            self.advance();

            match value {
                Ok(value) => return Some(Ok((key, value))),
                Err(CaskError::KeyNotFound) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
