//! Tests for WriteBatch
//!
//! These tests verify:
//! - Staged mutations are invisible until commit
//! - Commit applies every mutation
//! - A batch cut short by a crash vanishes on recovery
//! - Size limits and reuse

use std::path::Path;

use caskdb::config::{Config, SyncStrategy};
use caskdb::data::{log_record_key_with_seq, LogRecord, SegmentFile};
use caskdb::{CaskError, Engine, WriteBatchOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_engine(dir: &Path) -> Engine {
    let config = Config::builder()
        .data_dir(dir)
        .sync_strategy(SyncStrategy::EveryWrite)
        .build();
    Engine::open(config).unwrap()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    (temp_dir, engine)
}

/// Append the records of batch `seq_no` to segment `file_id` by hand
fn write_raw_batch(dir: &Path, file_id: u32, seq_no: u64, keys: &[&[u8]], with_marker: bool) {
    let segment = SegmentFile::open(dir, file_id).unwrap();
    for key in keys {
        let record = LogRecord::normal(log_record_key_with_seq(key, seq_no), b"batched".to_vec());
        segment.append(&record.encode()).unwrap();
    }
    if with_marker {
        segment
            .append(&LogRecord::txn_finished(seq_no).encode())
            .unwrap();
    }
    segment.sync().unwrap();
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_batch_invisible_before_commit() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.put(b"a", b"1").unwrap();
    batch.put(b"b", b"2").unwrap();

    assert_eq!(batch.len(), 2);
    assert!(matches!(engine.get(b"a"), Err(CaskError::KeyNotFound)));
    assert_eq!(engine.stat().unwrap().disk_size, 0);
}

#[test]
fn test_batch_commit_applies_all() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"old", b"x").unwrap();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.put(b"a", b"1").unwrap();
    batch.put(b"b", b"2").unwrap();
    batch.delete(b"old").unwrap();
    batch.commit().unwrap();

    assert_eq!(engine.get(b"a").unwrap(), b"1");
    assert_eq!(engine.get(b"b").unwrap(), b"2");
    assert!(matches!(engine.get(b"old"), Err(CaskError::KeyNotFound)));
    assert!(batch.is_empty());
}

#[test]
fn test_batch_last_write_per_key_wins() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.put(b"k", b"first").unwrap();
    batch.put(b"k", b"second").unwrap();
    assert_eq!(batch.len(), 1);
    batch.commit().unwrap();

    assert_eq!(engine.get(b"k").unwrap(), b"second");
}

#[test]
fn test_batch_delete_of_absent_key_drops_staged_put() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.put(b"k", b"v").unwrap();
    batch.delete(b"k").unwrap();

    assert!(batch.is_empty());
    batch.commit().unwrap();
    assert!(matches!(engine.get(b"k"), Err(CaskError::KeyNotFound)));
    assert_eq!(engine.seq_no(), 0);
}

#[test]
fn test_batch_empty_commit_is_noop() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.commit().unwrap();

    assert_eq!(engine.seq_no(), 0);
    assert_eq!(engine.stat().unwrap().disk_size, 0);
}

#[test]
fn test_batch_empty_key_rejected() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    assert!(matches!(batch.put(b"", b"v"), Err(CaskError::EmptyKey)));
    assert!(matches!(batch.delete(b""), Err(CaskError::EmptyKey)));
}

#[test]
fn test_batch_exceeds_max_batch_num() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions {
        max_batch_num: 2,
        sync_writes: false,
    });

    for key in [b"a", b"b", b"c"] {
        batch.put(key, b"v").unwrap();
    }

    assert!(matches!(
        batch.commit(),
        Err(CaskError::ExceedMaxBatchNum { max: 2 })
    ));
    assert!(matches!(engine.get(b"a"), Err(CaskError::KeyNotFound)));
    assert_eq!(batch.len(), 3);
}

#[test]
fn test_batch_reuse_takes_new_seq_no() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.put(b"a", b"1").unwrap();
    batch.commit().unwrap();
    batch.put(b"b", b"2").unwrap();
    batch.commit().unwrap();

    assert_eq!(engine.seq_no(), 2);
    assert_eq!(engine.list_keys(), vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn test_batch_marker_counts_as_reclaimable() {
    let (_temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());

    batch.put(b"a", b"1").unwrap();
    batch.commit().unwrap();

    let marker_len = LogRecord::txn_finished(1).encoded_len() as u64;
    assert_eq!(engine.stat().unwrap().reclaimable_size, marker_len);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_batch_survives_restart() {
    let (temp, engine) = setup_temp_engine();
    let batch = engine.new_write_batch(WriteBatchOptions::default());
    for i in 0..20 {
        batch.put(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    batch.commit().unwrap();
    drop(batch);
    drop(engine);

    let engine = open_engine(temp.path());
    assert_eq!(engine.list_keys().len(), 20);
}

#[test]
fn test_batch_without_marker_is_discarded() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"before", b"v").unwrap();
    let active = engine.active_file_id();
    engine.close().unwrap();

    // Crash after the records landed but before the commit marker
    write_raw_batch(temp.path(), active, 7, &[b"x", b"y"], false);

    let engine = open_engine(temp.path());
    assert_eq!(engine.get(b"before").unwrap(), b"v");
    assert!(matches!(engine.get(b"x"), Err(CaskError::KeyNotFound)));
    assert!(matches!(engine.get(b"y"), Err(CaskError::KeyNotFound)));

    // The unfinished sequence number is not handed out again
    assert_eq!(engine.seq_no(), 7);
}

#[test]
fn test_batch_with_marker_is_applied() {
    let (temp, engine) = setup_temp_engine();
    let active = engine.active_file_id();
    engine.close().unwrap();

    write_raw_batch(temp.path(), active, 3, &[b"x", b"y"], true);

    let engine = open_engine(temp.path());
    assert_eq!(engine.get(b"x").unwrap(), b"batched");
    assert_eq!(engine.get(b"y").unwrap(), b"batched");
    assert_eq!(engine.seq_no(), 3);
}

#[test]
fn test_batch_discarded_records_are_reclaimable() {
    let (temp, engine) = setup_temp_engine();
    let active = engine.active_file_id();
    engine.close().unwrap();

    write_raw_batch(temp.path(), active, 1, &[b"x"], false);

    let engine = open_engine(temp.path());
    let stat = engine.stat().unwrap();
    assert_eq!(stat.key_num, 0);
    assert_eq!(stat.reclaimable_size, stat.disk_size);
}

#[test]
fn test_batch_spanning_segments() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .max_active_file_size(64)
        .build();
    let engine = Engine::open(config.clone()).unwrap();

    let batch = engine.new_write_batch(WriteBatchOptions::default());
    for i in 0..30 {
        batch.put(format!("key-{i:02}").as_bytes(), b"value").unwrap();
    }
    batch.commit().unwrap();
    assert!(engine.file_ids().len() > 1);
    drop(batch);
    drop(engine);

    let engine = Engine::open(config).unwrap();
    assert_eq!(engine.list_keys().len(), 30);
}
