//! Tests for basic Engine operations
//!
//! These tests verify:
//! - get/put/delete semantics
//! - Empty key rejection
//! - Deleting absent keys is a no-op
//! - Engine lifecycle (open/close)

use caskdb::{CaskError, Engine};
use tempfile::TempDir;

use crate::{key, setup_temp_engine, test_config, value};

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_engine_open_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("mydb");

    let engine = Engine::open(test_config(&data_dir).build()).unwrap();

    assert!(data_dir.exists());
    assert!(data_dir.join("000000000.data").exists());
    assert_eq!(engine.active_file_id(), 0);
}

#[test]
fn test_engine_open_path_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();

    let engine = Engine::open_path(temp_dir.path()).unwrap();
    engine.put(b"k", b"v").unwrap();

    assert_eq!(engine.data_dir(), temp_dir.path());
    assert_eq!(engine.get(b"k").unwrap(), b"v");
}

#[test]
fn test_engine_put_get() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"hello", b"world").unwrap();

    assert_eq!(engine.get(b"hello").unwrap(), b"world");
}

#[test]
fn test_engine_get_nonexistent_key() {
    let (_temp, engine) = setup_temp_engine();

    assert!(matches!(engine.get(b"nonexistent"), Err(CaskError::KeyNotFound)));
}

#[test]
fn test_engine_overwrite() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"v1").unwrap();
    engine.put(b"key", b"v2").unwrap();

    assert_eq!(engine.get(b"key").unwrap(), b"v2");
}

#[test]
fn test_engine_empty_value() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"").unwrap();

    assert_eq!(engine.get(b"key").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_engine_delete() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"key", b"value").unwrap();

    engine.delete(b"key").unwrap();

    assert!(matches!(engine.get(b"key"), Err(CaskError::KeyNotFound)));
}

#[test]
fn test_engine_delete_then_put_again() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"key", b"old").unwrap();
    engine.delete(b"key").unwrap();

    engine.put(b"key", b"new").unwrap();

    assert_eq!(engine.get(b"key").unwrap(), b"new");
}

#[test]
fn test_engine_delete_absent_key_writes_nothing() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"present", b"v").unwrap();
    let before = engine.stat().unwrap();

    engine.delete(b"absent").unwrap();

    let after = engine.stat().unwrap();
    assert_eq!(after.disk_size, before.disk_size);
    assert_eq!(after.reclaimable_size, before.reclaimable_size);
}

#[test]
fn test_engine_empty_key_rejected() {
    let (_temp, engine) = setup_temp_engine();

    assert!(matches!(engine.put(b"", b"v"), Err(CaskError::EmptyKey)));
    assert!(matches!(engine.get(b""), Err(CaskError::EmptyKey)));
    assert!(matches!(engine.delete(b""), Err(CaskError::EmptyKey)));
}

#[test]
fn test_engine_binary_keys_and_values() {
    let (_temp, engine) = setup_temp_engine();
    let key = [0u8, 255, 1, 254];
    let value = vec![0u8; 4096];

    engine.put(&key, &value).unwrap();

    assert_eq!(engine.get(&key).unwrap(), value);
}

#[test]
fn test_engine_many_keys() {
    let (_temp, engine) = setup_temp_engine();

    for i in 0..500 {
        engine.put(&key(i), &value(i)).unwrap();
    }

    for i in 0..500 {
        assert_eq!(engine.get(&key(i)).unwrap(), value(i));
    }
    assert_eq!(engine.list_keys().len(), 500);
}

#[test]
fn test_engine_list_keys_sorted() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"b", b"2").unwrap();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"c", b"3").unwrap();
    engine.delete(b"b").unwrap();

    assert_eq!(engine.list_keys(), vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_engine_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).max_active_file_size(0).build();

    assert!(matches!(Engine::open(config), Err(CaskError::Config(_))));
}

#[test]
fn test_engine_close_then_reopen() {
    let (temp, engine) = setup_temp_engine();
    engine.put(b"key", b"value").unwrap();

    engine.close().unwrap();

    let engine = crate::reopen(temp.path());
    assert_eq!(engine.get(b"key").unwrap(), b"value");
}
