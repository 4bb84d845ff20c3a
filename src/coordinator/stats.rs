//! Operation counters and the diagnostics snapshot built from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::types::{MigrationStrategy, PersistenceMode};

use super::mirror::MirrorFailure;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub fallbacks: AtomicU64,
    pub upsert_conversions: AtomicU64,
    pub partial_failures: AtomicU64,
    pub validation_failures: AtomicU64,
    pub queued_writes: AtomicU64,
    pub replayed_writes: AtomicU64,
    pub syncs: AtomicU64,
    pub migrations: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Counters for the local mirror queue.
#[derive(Debug, Default)]
pub(crate) struct MirrorCounters {
    pub enqueued: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
    /// Jobs skipped because the target already held a newer version.
    pub superseded: AtomicU64,
}

/// Read-only snapshot returned by `get_persistence_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct PersistenceStats {
    pub mode: PersistenceMode,
    pub authenticated: bool,
    pub initialized: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_migration: Option<MigrationStrategy>,
    pub migration_state: &'static str,

    pub reads: u64,
    pub writes: u64,
    /// Cloud calls served by the local store after a transient failure.
    pub fallbacks: u64,
    /// Saves that found an existing record and became updates.
    pub upsert_conversions: u64,
    pub partial_failures: u64,
    pub validation_failures: u64,
    pub queued_writes: u64,
    pub replayed_writes: u64,
    pub syncs: u64,
    pub migrations: u64,

    pub mirror_enqueued: u64,
    pub mirror_completed: u64,
    pub mirror_failed: u64,
    pub mirror_dropped: u64,
    pub mirror_superseded: u64,
    pub mirror_pending: usize,
    pub recent_mirror_failures: Vec<MirrorFailure>,
}

pub(crate) struct StatsSource<'a> {
    pub mode: PersistenceMode,
    pub authenticated: bool,
    pub initialized: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_migration: Option<MigrationStrategy>,
    pub migration_state: &'static str,
    pub counters: &'a Counters,
    pub mirror: &'a MirrorCounters,
    pub mirror_pending: usize,
    pub recent_mirror_failures: Vec<MirrorFailure>,
}

impl From<StatsSource<'_>> for PersistenceStats {
    fn from(src: StatsSource<'_>) -> Self {
        let c = src.counters;
        let m = src.mirror;
        Self {
            mode: src.mode,
            authenticated: src.authenticated,
            initialized: src.initialized,
            last_sync_at: src.last_sync_at,
            pending_migration: src.pending_migration,
            migration_state: src.migration_state,
            reads: Counters::get(&c.reads),
            writes: Counters::get(&c.writes),
            fallbacks: Counters::get(&c.fallbacks),
            upsert_conversions: Counters::get(&c.upsert_conversions),
            partial_failures: Counters::get(&c.partial_failures),
            validation_failures: Counters::get(&c.validation_failures),
            queued_writes: Counters::get(&c.queued_writes),
            replayed_writes: Counters::get(&c.replayed_writes),
            syncs: Counters::get(&c.syncs),
            migrations: Counters::get(&c.migrations),
            mirror_enqueued: Counters::get(&m.enqueued),
            mirror_completed: Counters::get(&m.completed),
            mirror_failed: Counters::get(&m.failed),
            mirror_dropped: Counters::get(&m.dropped),
            mirror_superseded: Counters::get(&m.superseded),
            mirror_pending: src.mirror_pending,
            recent_mirror_failures: src.recent_mirror_failures,
        }
    }
}

impl PersistenceStats {
    /// Flatten into a plain key-value map for telemetry sinks.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}
