//! Adaptive persistence and sync coordinator for lists and items.
//!
//! A [`PersistenceCoordinator`] sits in front of an on-device store and a
//! remote backend. Depending on the session it routes reads and writes to
//! one or both, migrates the local dataset when a guest signs in, and
//! reconciles the two stores under latest-timestamp-wins.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod migration;
pub mod resolve;
pub mod sanitize;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::{BatchPolicy, CoordinatorOptions, RemoteOptions};
pub use coordinator::{
    BatchFailure, BatchReport, MirrorFailure, PersistenceCoordinator, PersistenceStats, StoreSide,
    TransitionOutcome, WriteOutcome,
};
pub use error::{
    MigrationError, MigrationFailure, Operation, PersistError, RemoteErrorKind, Result, StoreError,
    StoreResult,
};
pub use migration::{
    MigrationEngine, MigrationOutcome, MigrationProgress, MigrationProgressCallback,
    MigrationReport, MigrationState,
};
pub use resolve::{pick, resolve_conflict, Winner};
pub use sanitize::{dedupe, sanitize_items, sanitize_lists, sanitize_records, Sanitized};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use storage::{MemoryStore, RecordStore, RemoteStore};
pub use sync::{merge_snapshots, SyncEngine, SyncOptions, SyncReport, SyncScheduler};
pub use types::{
    generate_id, ItemRecord, ListRecord, MigrationStrategy, PersistenceMode, Record, RecordKind,
    Snapshot, SyncCursor, ValidationIssue, ValidationReason, Versioned,
};
