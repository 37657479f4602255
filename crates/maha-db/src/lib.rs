//! Durable per-feature state store (spec §4.2, §6).
//!
//! A feature's state lives as a single JSON document guarded by a
//! cross-process file lock, never a database: orchestration runs are
//! short-lived, single-repo, and the document is small enough to rewrite
//! wholesale on every mutation.

pub mod error;
pub mod lock;
pub mod models;
pub mod paths;
pub mod store;

pub use error::{Result, StoreError};
pub use models::{
    EventKind, ExecutionEvent, FileOwnership, GateOutcome, LevelRecord, LevelStatus, TaskRecord,
    TaskStatus, WorkerRecord, WorkerStatus,
};
pub use paths::StatePaths;
pub use store::{retry_backoff, StateDocument, StateStore};
