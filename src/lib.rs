//! # CaskDB
//!
//! An embedded, Bitcask-style key-value storage engine with:
//! - Append-only segment files with CRC32-checked records
//! - An in-memory (or disk-resident) index of key → record position
//! - Crash recovery that drops torn writes and unfinished batches
//! - Atomic write batches
//! - Online merge that reclaims space taken by stale records
//! - Single-writer/multi-reader concurrency model
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │         get / put / delete / iter / fold / merge             │
//! └──────────┬──────────────────┬───────────────────┬───────────┘
//!            │                  │                   │
//!            ▼                  ▼                   ▼
//!   ┌─────────────────┐ ┌───────────────┐  ┌─────────────────┐
//!   │   WriteBatch    │ │     Index     │  │      Merge      │
//!   │ (seq + marker)  │ │ BTree | Disk  │  │ (hint + swap)   │
//!   └────────┬────────┘ └───────▲───────┘  └────────┬────────┘
//!            │                  │ positions         │
//!            ▼                  │                   ▼
//!   ┌─────────────────────────────────────────────────────────┐
//!   │                Segment files (data module)               │
//!   │   000000000.data  000000001.data  ...  active (append)   │
//!   └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use caskdb::{Config, Engine};
//!
//! # fn main() -> caskdb::Result<()> {
//! let engine = Engine::open(Config::builder().data_dir("/tmp/caskdb").build())?;
//! engine.put(b"name", b"cask")?;
//! assert_eq!(engine.get(b"name")?, b"cask".to_vec());
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod data;
pub mod index;
pub mod engine;
pub mod batch;
mod merge;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CaskError, Result};
pub use config::{Config, IndexBackend, IteratorOptions, SyncStrategy, WriteBatchOptions};
pub use engine::{Engine, EngineIterator, Stat};
pub use batch::WriteBatch;
pub use merge::{merge_dir_path, MERGE_FINISHED_FILE_NAME};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CaskDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
