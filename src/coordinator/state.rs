//! Mutable coordinator state. Owned by one `PersistenceCoordinator`; engines
//! only ever see copies.

use chrono::{DateTime, Utc};

use crate::types::{MigrationStrategy, PersistenceMode, SyncCursor};

/// Local meta key for the last successful reconciliation time.
pub(crate) const META_SYNC_CURSOR: &str = "sync:last_at";
/// Local meta key marking a migration that still needs a decision.
pub(crate) const META_PENDING_MIGRATION: &str = "migration:pending";

#[derive(Debug, Clone)]
pub(crate) struct CoordinatorState {
    pub initialized: bool,
    pub authenticated: bool,
    pub mode: PersistenceMode,
    pub cursor: SyncCursor,
    pub pending_migration: Option<MigrationStrategy>,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            initialized: false,
            authenticated: false,
            mode: PersistenceMode::LocalOnly,
            cursor: SyncCursor::default(),
            pending_migration: None,
        }
    }
}

impl CoordinatorState {
    /// Mode implied by the session, before any explicit `set_mode`.
    pub fn initial_mode(authenticated: bool, pending: Option<MigrationStrategy>) -> PersistenceMode {
        if authenticated && pending.is_none() {
            PersistenceMode::CloudWithLocalBackup
        } else {
            PersistenceMode::LocalOnly
        }
    }
}

pub(crate) fn encode_cursor(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub(crate) fn decode_cursor(raw: &str) -> Option<SyncCursor> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| SyncCursor::at(at.with_timezone(&Utc)))
}

pub(crate) fn encode_strategy(strategy: MigrationStrategy) -> String {
    strategy.to_string()
}

pub(crate) fn decode_strategy(raw: &str) -> Option<MigrationStrategy> {
    match raw {
        "migrate_all_to_cloud" => Some(MigrationStrategy::MigrateAllToCloud),
        "ask_user" => Some(MigrationStrategy::AskUser),
        "cloud_only" => Some(MigrationStrategy::CloudOnly),
        "intelligent_merge" => Some(MigrationStrategy::IntelligentMerge),
        _ => None,
    }
}
