//! Tests for crash recovery
//!
//! These tests verify:
//! - Data written before a crash is rebuilt from the log
//! - Deletes survive a restart
//! - A torn write at the end of the newest segment is cut off
//! - Corruption elsewhere fails the open
//! - Sequence numbers and reclaimable space are restored

use std::fs::{self, OpenOptions};
use std::io::Write;

use caskdb::data::{log_record_key_with_seq, segment_path, LogRecord, NON_TXN_SEQ_NO};
use caskdb::{CaskError, Engine, WriteBatchOptions};

use crate::{
    init_tracing, key, reopen, setup_temp_engine, setup_temp_engine_with_small_files,
    test_config, value,
};

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_recovery_after_crash() {
    let (temp, engine) = setup_temp_engine();
    for i in 0..100 {
        engine.put(&key(i), &value(i)).unwrap();
    }

    // Dropping without close simulates a crash
    drop(engine);

    let engine = reopen(temp.path());
    for i in 0..100 {
        assert_eq!(engine.get(&key(i)).unwrap(), value(i));
    }
}

#[test]
fn test_recovery_replays_deletes_and_overwrites() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.put(b"a", b"3").unwrap();
    engine.delete(b"b").unwrap();
    drop(engine);

    let engine = reopen(temp.path());

    assert_eq!(engine.get(b"a").unwrap(), b"3");
    assert!(matches!(engine.get(b"b"), Err(CaskError::KeyNotFound)));
    assert_eq!(engine.list_keys(), vec![b"a".to_vec()]);
}

#[test]
fn test_recovery_across_segments() {
    let (temp, engine) = setup_temp_engine_with_small_files();
    for i in 0..50 {
        engine.put(&key(i), &value(i)).unwrap();
    }
    let files = engine.file_ids();
    assert!(files.len() > 1);
    drop(engine);

    let engine = Engine::open(
        test_config(temp.path())
            .max_active_file_size(128)
            .build(),
    )
    .unwrap();

    assert_eq!(engine.file_ids(), files);
    for i in 0..50 {
        assert_eq!(engine.get(&key(i)).unwrap(), value(i));
    }
}

#[test]
fn test_recovery_restores_reclaimable_size() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"a", b"2").unwrap();
    engine.delete(b"a").unwrap();
    let before = engine.stat().unwrap().reclaimable_size;
    assert!(before > 0);
    drop(engine);

    let engine = reopen(temp.path());

    assert_eq!(engine.stat().unwrap().reclaimable_size, before);
}

#[test]
fn test_recovery_restores_seq_no() {
    let (temp, engine) = setup_temp_engine();
    for round in 0..3 {
        let batch = engine.new_write_batch(WriteBatchOptions::default());
        batch.put(&key(round), &value(round)).unwrap();
        batch.commit().unwrap();
    }
    assert_eq!(engine.seq_no(), 3);
    drop(engine);

    let engine = reopen(temp.path());
    assert_eq!(engine.seq_no(), 3);

    let batch = engine.new_write_batch(WriteBatchOptions::default());
    batch.put(b"next", b"v").unwrap();
    batch.commit().unwrap();
    assert_eq!(engine.seq_no(), 4);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_recovery_truncates_torn_write() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.close().unwrap();

    let path = segment_path(temp.path(), 0);
    let valid_len = fs::metadata(&path).unwrap().len();
    let partial = LogRecord::normal(b"\x00c".to_vec(), b"a value that never landed".to_vec()).encode();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&partial[..partial.len() - 5]).unwrap();
    drop(file);

    let engine = reopen(temp.path());

    assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
    assert_eq!(engine.get(b"a").unwrap(), b"1");
    assert_eq!(engine.get(b"b").unwrap(), b"2");
    assert!(matches!(engine.get(b"c"), Err(CaskError::KeyNotFound)));

    // New writes go after the surviving records and replay cleanly
    engine.put(b"d", b"4").unwrap();
    drop(engine);
    let engine = reopen(temp.path());
    assert_eq!(engine.get(b"d").unwrap(), b"4");
    assert_eq!(engine.list_keys().len(), 3);
}

#[test]
fn test_recovery_truncates_corrupt_checksum_at_tail() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.close().unwrap();

    // Flip the last byte: the final record fails its checksum
    let path = segment_path(temp.path(), 0);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let engine = reopen(temp.path());

    assert_eq!(engine.get(b"a").unwrap(), b"1");
    assert!(matches!(engine.get(b"b"), Err(CaskError::KeyNotFound)));
}

#[test]
fn test_recovery_rejects_corruption_before_tail_of_active_segment() {
    init_tracing();
    let (temp, engine) = setup_temp_engine();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.put(b"c", b"3").unwrap();
    engine.close().unwrap();

    // Damage the value byte of the first record; "b" and "c" follow it intact
    let first_len = LogRecord::normal(log_record_key_with_seq(b"a", NON_TXN_SEQ_NO), b"1".to_vec())
        .encode()
        .len();
    let path = segment_path(temp.path(), 0);
    let mut bytes = fs::read(&path).unwrap();
    let valid_len = bytes.len() as u64;
    bytes[first_len - 1] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let result = Engine::open(test_config(temp.path()).build());

    assert!(matches!(
        result,
        Err(CaskError::DirectoryCorrupted { file_id: 0, offset: 0 })
    ));
    // Nothing was cut from the segment
    assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
}

#[test]
fn test_recovery_truncates_zero_filled_tail() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"a", b"1").unwrap();
    engine.close().unwrap();

    let path = segment_path(temp.path(), 0);
    let valid_len = fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0u8; 64]).unwrap();
    drop(file);

    let engine = reopen(temp.path());

    assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
    assert_eq!(engine.get(b"a").unwrap(), b"1");
}

#[test]
fn test_recovery_rejects_corruption_in_sealed_segment() {
    init_tracing();
    let (temp, engine) = setup_temp_engine_with_small_files();
    for i in 0..20 {
        engine.put(&key(i), &value(i)).unwrap();
    }
    assert!(engine.file_ids().len() > 2);
    engine.close().unwrap();

    let path = segment_path(temp.path(), 0);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let result = Engine::open(
        test_config(temp.path())
            .max_active_file_size(128)
            .build(),
    );

    assert!(matches!(
        result,
        Err(CaskError::DirectoryCorrupted { file_id: 0, .. })
    ));
}
