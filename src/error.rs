use std::fmt;

use thiserror::Error;

use crate::types::{PersistenceMode, RecordKind, ValidationIssue};

/// Crate-wide result type.
pub type Result<T, E = PersistError> = std::result::Result<T, E>;

/// Result type returned by store adapters.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// StoreError
// ============================================================================

/// Failure reported by a local or remote store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: RecordKind, id: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Unknown store error: {0}")]
    Unknown(String),

    #[error("Backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Classification the remote adapter applies to every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    PermissionDenied,
    NotFound,
    Unreachable,
    Unknown,
}

impl StoreError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::PermissionDenied(_) => RemoteErrorKind::PermissionDenied,
            Self::NotFound { .. } => RemoteErrorKind::NotFound,
            Self::Unreachable(_) => RemoteErrorKind::Unreachable,
            Self::AlreadyExists { .. }
            | Self::Invalid(_)
            | Self::Unknown(_)
            | Self::Backend { .. } => RemoteErrorKind::Unknown,
        }
    }

    /// Eligible for retry and for fallback to the other store.
    ///
    /// Duplicate and validation failures are structural and never transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Unknown(_) | Self::Backend { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

// ============================================================================
// Operation
// ============================================================================

/// Coordinator operation names carried by `PersistError::Store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetAllLists,
    SaveList,
    UpdateList,
    DeleteList,
    GetItemsByListId,
    SaveItem,
    UpdateItem,
    DeleteItem,
    SaveMultipleItems,
    ForceSyncAll,
    ForceReload,
    Initialize,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetAllLists => "getAllLists",
            Self::SaveList => "saveList",
            Self::UpdateList => "updateList",
            Self::DeleteList => "deleteList",
            Self::GetItemsByListId => "getItemsByListId",
            Self::SaveItem => "saveItem",
            Self::UpdateItem => "updateItem",
            Self::DeleteItem => "deleteItem",
            Self::SaveMultipleItems => "saveMultipleItems",
            Self::ForceSyncAll => "forceSyncAll",
            Self::ForceReload => "forceReloadFromPersistence",
            Self::Initialize => "initialize",
        };
        f.write_str(name)
    }
}

// ============================================================================
// MigrationError
// ============================================================================

/// Migration stopped part-way. Already-migrated records are kept.
#[derive(Debug, Error)]
#[error("Migration failed after {completed}/{total} records: {cause}")]
pub struct MigrationError {
    pub completed: usize,
    pub total: usize,
    #[source]
    pub cause: MigrationFailure,
}

#[derive(Debug, Error)]
pub enum MigrationFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,
}

// ============================================================================
// PersistError
// ============================================================================

/// Error surfaced by the persistence coordinator.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("{operation} failed{} in {mode} mode: {source}", fmt_id(.id))]
    Store {
        operation: Operation,
        id: Option<String>,
        mode: PersistenceMode,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Sync failed: {0}")]
    Sync(#[source] StoreError),

    #[error("Another mode transition or migration is already running")]
    TransitionRejected,

    #[error("Operation requires an authenticated session")]
    NotAuthenticated,

    #[error("A migration decision is pending")]
    MigrationPending,

    #[error("Coordinator not initialized")]
    NotInitialized,

    #[error("Operation cancelled")]
    Cancelled,
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn fmt_id(id: &Option<String>) -> String {
    id.as_ref().map(|id| format!(" for {id}")).unwrap_or_default()
}

impl PersistError {
    pub(crate) fn store(
        operation: Operation,
        id: Option<&str>,
        mode: PersistenceMode,
        source: StoreError,
    ) -> Self {
        Self::Store {
            operation,
            id: id.map(str::to_string),
            mode,
            source,
        }
    }

    /// Underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store { source, .. } | Self::Sync(source) => Some(source),
            Self::Migration(MigrationError {
                cause: MigrationFailure::Store(source),
                ..
            }) => Some(source),
            _ => None,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.store_error()
            .is_some_and(StoreError::is_permission_denied)
    }

    /// Map to a sentence suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(issues) => match issues.as_slice() {
                [issue] => format!("This entry can't be saved: {}.", issue.reason),
                _ => format!("{} entries can't be saved because they are incomplete.", issues.len()),
            },
            Self::TransitionRejected => {
                "Your data is being moved right now. Please try again in a moment.".to_string()
            }
            Self::NotAuthenticated => "Sign in to use cloud sync.".to_string(),
            Self::MigrationPending => {
                "Choose what to do with the data on this device before turning on sync.".to_string()
            }
            Self::NotInitialized => "Storage is still starting up.".to_string(),
            Self::Cancelled => "The operation was cancelled.".to_string(),
            Self::Migration(MigrationError {
                cause: MigrationFailure::Cancelled,
                ..
            }) => "Moving your data was cancelled. Nothing was lost.".to_string(),
            _ => match self.store_error().map(StoreError::kind) {
                Some(RemoteErrorKind::PermissionDenied) => {
                    "You don't have permission to change this data.".to_string()
                }
                Some(RemoteErrorKind::NotFound) => "This entry no longer exists.".to_string(),
                Some(RemoteErrorKind::Unreachable) => {
                    "You appear to be offline. Changes will sync when you reconnect.".to_string()
                }
                _ => "Something went wrong while saving your data.".to_string(),
            },
        }
    }
}
