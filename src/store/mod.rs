//! Persistence for the task tree and its relational mirror
//!
//! The JSON tree file is authoritative. The SQLite mirror holds the flattened
//! per-task rows plus the extension fields that never appear in the tree.

mod lock;
mod mirror;
mod tree_file;

use std::path::PathBuf;

use thiserror::Error;

pub use lock::{FileLock, DEFAULT_LOCK_TIMEOUT};
pub use mirror::{Mirror, RecordPatch, SyncReport, TaskRecord};
pub use tree_file::{Loaded, TreeStore};

/// Errors raised by the tree file, the mirror, or the lock guarding them
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for lock {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}
