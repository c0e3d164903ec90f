//! Write Batch
//!
//! Stages puts and deletes and commits them as one unit.
//!
//! ## Commit Protocol
//! ```text
//!   seq = ++engine.seq_no
//!   append  [seq|key1] Normal   ...
//!   append  [seq|key2] Deleted  ...
//!   append  [seq|txn-fin] TxnFinished     ◄── commit point
//!   sync (per options)
//!   apply all staged mutations to the index    ◄── under the segments write lock
//! ```
//! Readers take the segments read lock, so they see a batch whole or not at
//! all. An index update that fails after the marker is retried once; if it
//! still fails, commit reports `BatchCommitFailed` and the next open replays
//! the batch from the log.
//! Recovery only applies records tagged with `seq` once it has read the
//! `TxnFinished` marker for `seq`, so a crash before the marker lands makes
//! the whole batch disappear.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::WriteBatchOptions;
use crate::data::{log_record_key_with_seq, LogRecord, LogRecordPos};
use crate::engine::{Engine, EngineInner};
use crate::error::{CaskError, Result};

/// A set of mutations that become visible together
///
/// Nothing reaches the log until [`commit`](Self::commit). A key staged twice
/// keeps only its last mutation.
pub struct WriteBatch<'a> {
    engine: &'a Engine,
    options: WriteBatchOptions,
    pending: Mutex<PendingWrites>,
}

#[derive(Default)]
struct PendingWrites {
    /// Mutations in staging order; `None` marks a discarded slot
    records: Vec<Option<LogRecord>>,
    /// User key → slot in `records`
    slots: HashMap<Vec<u8>, usize>,
}

impl PendingWrites {
    fn stage(&mut self, record: LogRecord) {
        match self.slots.get(&record.key) {
            Some(&slot) => self.records[slot] = Some(record),
            None => {
                self.slots.insert(record.key.clone(), self.records.len());
                self.records.push(Some(record));
            }
        }
    }

    fn discard(&mut self, key: &[u8]) {
        if let Some(slot) = self.slots.remove(key) {
            self.records[slot] = None;
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.records.clear();
        self.slots.clear();
    }
}

impl<'a> WriteBatch<'a> {
    pub(crate) fn new(engine: &'a Engine, options: WriteBatchOptions) -> Self {
        Self {
            engine,
            options,
            pending: Mutex::new(PendingWrites::default()),
        }
    }

    /// Stage a put
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }
        self.pending
            .lock()
            .stage(LogRecord::normal(key.to_vec(), value.to_vec()));
        Ok(())
    }

    /// Stage a delete
    ///
    /// If the key is not in the engine, any staged put for it is dropped and
    /// nothing is logged.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CaskError::EmptyKey);
        }

        let mut pending = self.pending.lock();
        if self.engine.inner().index.get(key).is_none() {
            pending.discard(key);
            return Ok(());
        }
        pending.stage(LogRecord::deleted(key.to_vec()));
        Ok(())
    }

    /// Number of staged mutations
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every staged mutation atomically
    ///
    /// Steps:
    /// 1. Reject batches larger than `max_batch_num`
    /// 2. Acquire the engine write lock and take the next sequence number
    /// 3. Append each mutation, then the commit marker
    /// 4. Sync if `sync_writes` is set (or the engine syncs every write)
    /// 5. Apply the mutations to the index
    ///
    /// The batch is emptied once the marker is logged, whether or not every
    /// index update succeeded, and can be reused.
    pub fn commit(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        let count = pending.len();
        if count == 0 {
            return Ok(());
        }
        if count > self.options.max_batch_num {
            return Err(CaskError::ExceedMaxBatchNum {
                max: self.options.max_batch_num,
            });
        }

        let engine = self.engine.inner();
        {
            let _write_guard = engine.write_lock.lock();
            let seq_no = engine.seq_no.fetch_add(1, Ordering::AcqRel) + 1;

            let mut logged = Vec::with_capacity(count);
            for record in pending.records.iter().flatten() {
                let entry = LogRecord {
                    key: log_record_key_with_seq(&record.key, seq_no),
                    value: record.value.clone(),
                    rec_type: record.rec_type,
                };
                let pos = engine.append_log_record(&entry).map_err(commit_failed)?;
                logged.push((record, pos));
            }

            let marker = engine
                .append_log_record(&LogRecord::txn_finished(seq_no))
                .map_err(commit_failed)?;
            engine
                .sync_after_write(self.options.sync_writes)
                .map_err(commit_failed)?;

            // From here on the batch is committed in the log
            let failed = {
                let _visible = engine.segments.write();
                let mut failed = None;
                for (record, pos) in logged {
                    if let Err(e) = apply_with_retry(engine, record, pos) {
                        failed.get_or_insert(e);
                    }
                }
                failed
            };
            engine.add_reclaimable(marker.size);

            if let Some(e) = failed {
                pending.clear();
                return Err(commit_failed(e));
            }
            debug!(seq_no, records = count, "write batch committed");
        }

        pending.clear();
        drop(pending);
        self.engine.maybe_schedule_merge();
        Ok(())
    }
}

/// Apply one logged mutation, trying once more if the index rejects it
///
/// The record is already committed, so a mutation that still fails is only
/// missing in memory; the next open replays it from the log.
fn apply_with_retry(engine: &EngineInner, record: &LogRecord, pos: LogRecordPos) -> Result<()> {
    let apply = || engine.apply_to_index(record.key.clone(), record.rec_type, pos);
    apply().or_else(|first| {
        warn!(error = %first, "index update for committed batch failed, retrying");
        apply()
    })
}

fn commit_failed(err: CaskError) -> CaskError {
    CaskError::BatchCommitFailed(Box::new(err))
}
