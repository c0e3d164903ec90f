//! Tests for the index backends


use caskdb::data::LogRecordPos;

pub fn pos(file_id: u32, offset: u64) -> LogRecordPos {
    LogRecordPos {
        file_id,
        offset,
        size: 10,
    }
}
