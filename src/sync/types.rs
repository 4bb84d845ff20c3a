//! Sync-specific types: reports, error events, progress and options.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::types::{RecordKind, ValidationIssue};

// ============================================================================
// Sync Result Types
// ============================================================================

/// Aggregated result of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Lists written to the remote store.
    pub lists_pushed: usize,
    /// Lists written to the local store.
    pub lists_pulled: usize,
    pub items_pushed: usize,
    pub items_pulled: usize,
    /// Identifiers present on both sides with differing versions.
    pub conflicts: usize,
    /// Records dropped by validation on either side.
    pub rejected: Vec<ValidationIssue>,
    pub errors: Vec<SyncErrorEvent>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    /// Total records written to either store.
    pub fn writes(&self) -> usize {
        self.lists_pushed + self.lists_pulled + self.items_pushed + self.items_pulled
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Classification of sync errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncErrorKind {
    /// Retriable (network, temporary failures)
    Transient,
    /// Not retriable (validation, conflicting parent, etc.)
    Permanent,
    /// Rejected by the remote's authorization policy
    Auth,
}

impl From<&StoreError> for SyncErrorKind {
    fn from(e: &StoreError) -> Self {
        if e.is_permission_denied() {
            Self::Auth
        } else if e.is_transient() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

/// A per-record sync error, collected in `SyncReport.errors`, never thrown.
#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub record: RecordKind,
    pub id: Option<String>,
    pub error: String,
    pub kind: SyncErrorKind,
}

impl SyncErrorEvent {
    pub(crate) fn from_store(phase: SyncPhase, record: RecordKind, id: &str, e: &StoreError) -> Self {
        Self {
            phase,
            record,
            id: Some(id.to_string()),
            error: e.to_string(),
            kind: SyncErrorKind::from(e),
        }
    }
}

/// Direction of a write during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    /// Local → remote.
    Push,
    /// Remote → local.
    Pull,
}

/// Progress callback payload.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub record: RecordKind,
    pub processed: usize,
    pub total: usize,
}

pub type SyncProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;
pub type SyncErrorCallback = Arc<dyn Fn(&SyncErrorEvent) + Send + Sync>;

// ============================================================================
// SyncOptions
// ============================================================================

/// Per-call hooks for `SyncEngine::force_sync_all`.
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Called for each per-record sync error
    pub on_error: Option<SyncErrorCallback>,
    /// Called after each record is reconciled
    pub on_progress: Option<SyncProgressCallback>,
}
