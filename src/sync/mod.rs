pub mod engine;
pub mod scheduler;
pub mod types;

pub use engine::{merge_records, merge_snapshots, SyncEngine};
pub use scheduler::SyncScheduler;
pub use types::{
    SyncErrorCallback, SyncErrorEvent, SyncErrorKind, SyncOptions, SyncPhase, SyncProgress,
    SyncProgressCallback, SyncReport,
};
