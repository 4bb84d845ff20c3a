//! PersistenceCoordinator: the facade callers talk to.
//!
//! Holds the current persistence mode and routes every CRUD call to the
//! local store, the remote store, or both:
//!
//! | mode                   | reads                           | writes                              |
//! |------------------------|---------------------------------|-------------------------------------|
//! | `LocalOnly`            | local                           | local                               |
//! | `CloudWithLocalBackup` | cloud, local on transient error | cloud, then queued mirror to local  |
//! | `Hybrid`               | merge of both                   | both, partial failure reported      |
//!
//! Mode switches and migrations are serialized; CRUD calls never wait on
//! them, but writes issued while a migration runs are parked and replayed.

mod mirror;
mod queue;
mod state;
mod stats;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{BatchPolicy, CoordinatorOptions};
use crate::error::{Operation, PersistError, Result, StoreError, StoreResult};
use crate::migration::{
    MigrationEngine, MigrationOutcome, MigrationProgressCallback, MigrationReport, MigrationState,
};
use crate::sanitize::{dedupe, sanitize_items};
use crate::storage::{upsert_record, RecordStore, RemoteStore};
use crate::sync::{merge_records, SyncEngine, SyncOptions, SyncReport};
use crate::types::{
    ItemRecord, ListRecord, MigrationStrategy, PersistenceMode, Record, RecordKind, Snapshot,
    SyncCursor, ValidationIssue, ValidationReason, Versioned,
};

pub use mirror::MirrorFailure;
pub use stats::PersistenceStats;

use mirror::Mirror;
use queue::{Admission, PendingWrite, WriteGate};
use state::{
    decode_cursor, decode_strategy, encode_cursor, encode_strategy, CoordinatorState,
    META_PENDING_MIGRATION, META_SYNC_CURSOR,
};
use stats::{Counters, StatsSource};

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Local,
    Cloud,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// Result of a single write.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Written to every store the mode requires (the local mirror, if any,
    /// follows in the background).
    Applied,
    /// Parked behind a running migration; replayed when it finishes.
    Queued,
    /// `Hybrid` only: one side took the write, the other failed.
    Partial { failed: StoreSide, error: StoreError },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug)]
pub struct BatchFailure {
    pub id: String,
    pub error: PersistError,
}

/// Result of `save_multiple_items`.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub saved: Vec<String>,
    pub queued: Vec<String>,
    /// Items dropped before any write.
    pub rejected: Vec<ValidationIssue>,
    /// Items whose write failed.
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    /// Identifiers that did not make it into any store.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.rejected
            .iter()
            .map(|i| i.id.as_str())
            .chain(self.failures.iter().map(|f| f.id.as_str()))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.failures.is_empty()
    }
}

/// What an authentication change or migration request did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Unchanged,
    SignedOut,
    /// `AskUser`: data stays local until `run_pending_migration` is called.
    AwaitingDecision,
    Migrated(MigrationReport),
}

// ============================================================================
// PersistenceCoordinator
// ============================================================================

pub struct PersistenceCoordinator {
    local: Arc<dyn RecordStore>,
    remote: Arc<dyn RecordStore>,
    options: CoordinatorOptions,
    state: Mutex<CoordinatorState>,
    /// Serializes mode switches, migrations and full syncs.
    transition: tokio::sync::Mutex<()>,
    gate: WriteGate,
    mirror: Mirror,
    sync: SyncEngine,
    migration: MigrationEngine,
    migration_progress: Mutex<Option<MigrationProgressCallback>>,
    cancel: Mutex<CancellationToken>,
    counters: Counters,
}

impl PersistenceCoordinator {
    /// `remote` should already apply timeouts and retries; see
    /// [`with_remote_backend`](Self::with_remote_backend).
    pub fn new(
        local: Arc<dyn RecordStore>,
        remote: Arc<dyn RecordStore>,
        options: CoordinatorOptions,
    ) -> Self {
        let mirror = Mirror::new(
            local.clone(),
            options.mirror_queue_capacity,
            options.mirror_workers,
            options.mirror_failure_log,
        );
        Self {
            sync: SyncEngine::new(local.clone(), remote.clone()),
            migration: MigrationEngine::new(local.clone(), remote.clone()),
            local,
            remote,
            options,
            state: Mutex::new(CoordinatorState::default()),
            transition: tokio::sync::Mutex::new(()),
            gate: WriteGate::default(),
            mirror,
            migration_progress: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            counters: Counters::default(),
        }
    }

    /// Wrap a raw network backend in [`RemoteStore`] using `options.remote()`.
    pub fn with_remote_backend<R>(local: Arc<dyn RecordStore>, backend: R, options: CoordinatorOptions) -> Self
    where
        R: RecordStore + 'static,
    {
        let remote = Arc::new(RemoteStore::new(backend, options.remote()));
        Self::new(local, remote, options)
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Set the initial mode and load persisted markers. Must be called from
    /// within a Tokio runtime; it starts the mirror workers.
    pub async fn initialize(&self, is_authenticated: bool) -> Result<()> {
        let _guard = self.transition.lock().await;
        let fail = |e| PersistError::store(Operation::Initialize, None, PersistenceMode::LocalOnly, e);

        let pending = match self.local.get_meta(META_PENDING_MIGRATION).await.map_err(fail)? {
            Some(raw) => {
                let strategy = decode_strategy(&raw);
                if strategy.is_none() {
                    tracing::warn!(marker = %raw, "ignoring unreadable migration marker");
                }
                strategy
            }
            None => None,
        };
        let cursor = self
            .local
            .get_meta(META_SYNC_CURSOR)
            .await
            .map_err(fail)?
            .and_then(|raw| decode_cursor(&raw))
            .unwrap_or_default();

        let mode = CoordinatorState::initial_mode(is_authenticated, pending);
        *self.state.lock() = CoordinatorState {
            initialized: true,
            authenticated: is_authenticated,
            mode,
            cursor,
            pending_migration: pending,
        };
        self.mirror.start();

        tracing::info!(
            %mode,
            authenticated = is_authenticated,
            pending_migration = ?pending,
            "persistence coordinator initialized"
        );
        Ok(())
    }

    /// React to sign-in and sign-out.
    ///
    /// Sign-in runs a migration with `strategy` (default `AskUser`, which
    /// moves nothing). Sign-out waits for the local mirror to drain and
    /// drops to `LocalOnly`; cloud data is left untouched.
    pub async fn update_authentication_state(
        &self,
        is_authenticated: bool,
        strategy: Option<MigrationStrategy>,
    ) -> Result<TransitionOutcome> {
        self.ensure_initialized()?;
        let _guard = self.transition.lock().await;
        let was_authenticated = self.state.lock().authenticated;

        match (was_authenticated, is_authenticated) {
            (false, true) => {
                self.state.lock().authenticated = true;
                let strategy = strategy.unwrap_or_default();
                tracing::info!(%strategy, "session authenticated");
                self.run_migration(strategy).await
            }
            (true, false) => {
                self.mirror.wait_idle().await;
                {
                    let mut state = self.state.lock();
                    state.authenticated = false;
                    state.mode = PersistenceMode::LocalOnly;
                }
                tracing::info!("session signed out, persistence is local only");
                Ok(TransitionOutcome::SignedOut)
            }
            _ => Ok(TransitionOutcome::Unchanged),
        }
    }

    /// Resolve a pending `AskUser` (or a failed migration) with a concrete
    /// strategy.
    pub async fn run_pending_migration(&self, strategy: MigrationStrategy) -> Result<TransitionOutcome> {
        self.ensure_initialized()?;
        let _guard = self.transition.lock().await;
        let (authenticated, pending) = {
            let state = self.state.lock();
            (state.authenticated, state.pending_migration)
        };
        if !authenticated {
            return Err(PersistError::NotAuthenticated);
        }
        if pending.is_none() {
            return Ok(TransitionOutcome::Unchanged);
        }
        self.run_migration(strategy).await
    }

    /// Switch mode explicitly. Rejected while another transition runs.
    pub async fn set_mode(&self, mode: PersistenceMode) -> Result<()> {
        self.ensure_initialized()?;
        let Ok(_guard) = self.transition.try_lock() else {
            return Err(PersistError::TransitionRejected);
        };
        let (current, authenticated, pending) = {
            let state = self.state.lock();
            (state.mode, state.authenticated, state.pending_migration)
        };
        if mode == current {
            return Ok(());
        }
        if mode.uses_cloud() {
            if !authenticated {
                return Err(PersistError::NotAuthenticated);
            }
            if pending.is_some() {
                return Err(PersistError::MigrationPending);
            }
        }
        if current == PersistenceMode::CloudWithLocalBackup {
            self.mirror.wait_idle().await;
        }
        self.state.lock().mode = mode;
        tracing::info!(from = %current, to = %mode, "persistence mode changed");
        Ok(())
    }

    /// Progress hook for subsequent migrations.
    pub fn set_migration_progress(&self, callback: Option<MigrationProgressCallback>) {
        *self.migration_progress.lock() = callback;
    }

    /// Cooperatively cancel the running sync or migration. It stops before
    /// its next record.
    pub fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
        tracing::info!("cancellation requested");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn mode(&self) -> PersistenceMode {
        self.state.lock().mode
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    pub fn pending_migration(&self) -> Option<MigrationStrategy> {
        self.state.lock().pending_migration
    }

    pub fn sync_cursor(&self) -> SyncCursor {
        self.state.lock().cursor
    }

    pub fn migration_state(&self) -> MigrationState {
        self.migration.state()
    }

    /// Resolve once every queued local mirror write has been attempted.
    pub async fn wait_for_mirror(&self) {
        self.mirror.wait_idle().await;
    }

    pub fn get_persistence_stats(&self) -> PersistenceStats {
        let state = self.state.lock().clone();
        PersistenceStats::from(StatsSource {
            mode: state.mode,
            authenticated: state.authenticated,
            initialized: state.initialized,
            last_sync_at: state.cursor.last_sync_at,
            pending_migration: state.pending_migration,
            migration_state: self.migration.state().label(),
            counters: &self.counters,
            mirror: self.mirror.counters(),
            mirror_pending: self.mirror.pending(),
            recent_mirror_failures: self.mirror.recent_failures(),
        })
    }

    // ========================================================================
    // Lists
    // ========================================================================

    pub async fn get_all_lists(&self) -> Result<Vec<ListRecord>> {
        self.ensure_initialized()?;
        self.read_routed(Operation::GetAllLists, None, |store| async move {
            store.get_all_lists().await
        })
        .await
    }

    /// Insert, or update if the identifier already exists.
    pub async fn save_list(&self, list: ListRecord) -> Result<WriteOutcome> {
        self.ensure_initialized()?;
        let record = self.validated(list.into())?;
        self.write(Operation::SaveList, record).await
    }

    pub async fn update_list(&self, list: ListRecord) -> Result<WriteOutcome> {
        self.ensure_initialized()?;
        let record = self.validated(list.into())?;
        self.write(Operation::UpdateList, record).await
    }

    /// Tombstone a list and every live item in it.
    pub async fn delete_list(&self, id: &str) -> Result<WriteOutcome> {
        self.ensure_initialized()?;
        let op = Operation::DeleteList;
        let Some(mut list) = self.find_list(op, id).await? else {
            return Err(self.not_found(op, RecordKind::List, id));
        };
        let now = Utc::now();
        let items = self.items_of(op, id).await?;
        for mut item in items {
            item.tombstone(now);
            self.write(Operation::DeleteItem, item.into()).await?;
        }
        list.tombstone(now);
        self.write(op, list.into()).await
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Live items of a list, highest rank first.
    pub async fn get_items_by_list_id(&self, list_id: &str) -> Result<Vec<ItemRecord>> {
        self.ensure_initialized()?;
        self.items_of(Operation::GetItemsByListId, list_id).await
    }

    /// Insert, or update if the identifier already exists. The parent list
    /// must exist.
    pub async fn save_item(&self, item: ItemRecord) -> Result<WriteOutcome> {
        self.ensure_initialized()?;
        let op = Operation::SaveItem;
        self.ensure_parent(op, &item).await?;
        let record = self.validated(item.into())?;
        self.write(op, record).await
    }

    pub async fn update_item(&self, item: ItemRecord) -> Result<WriteOutcome> {
        self.ensure_initialized()?;
        let op = Operation::UpdateItem;
        self.ensure_parent(op, &item).await?;
        let record = self.validated(item.into())?;
        self.write(op, record).await
    }

    pub async fn delete_item(&self, id: &str) -> Result<WriteOutcome> {
        self.ensure_initialized()?;
        let op = Operation::DeleteItem;
        let Some(mut item) = self.find_item(op, id).await? else {
            return Err(self.not_found(op, RecordKind::Item, id));
        };
        item.tombstone(Utc::now());
        self.write(op, item.into()).await
    }

    /// Validate the whole batch first, then write item by item. A failed
    /// write never undoes earlier ones.
    ///
    /// With `BatchPolicy::RejectAll` any invalid item aborts the batch before
    /// the first write; with `SkipInvalid` invalid items are only reported.
    pub async fn save_multiple_items(&self, items: Vec<ItemRecord>) -> Result<BatchReport> {
        self.ensure_initialized()?;
        let op = Operation::SaveMultipleItems;

        let mut known: HashSet<String> = self
            .read_routed(op, None, |store| async move { store.get_all_lists().await })
            .await?
            .into_iter()
            .map(|l| l.id)
            .collect();
        for item in &items {
            if self.gate.holds(RecordKind::List, &item.list_id) {
                known.insert(item.list_id.clone());
            }
        }

        let sanitized = sanitize_items(items, &known);
        if !sanitized.rejected.is_empty() {
            Counters::add(&self.counters.validation_failures, sanitized.rejected.len());
            tracing::debug!(rejected = sanitized.rejected.len(), "batch contains invalid items");
            if self.options.batch_policy == BatchPolicy::RejectAll {
                return Err(PersistError::Validation(sanitized.rejected));
            }
        }

        let mut report = BatchReport {
            rejected: sanitized.rejected,
            ..Default::default()
        };
        for item in sanitized.records {
            let id = item.id.clone();
            match self.write(op, item.into()).await {
                Ok(WriteOutcome::Queued) => report.queued.push(id),
                Ok(_) => report.saved.push(id),
                Err(error) => report.failures.push(BatchFailure { id, error }),
            }
        }

        if !report.is_complete() {
            tracing::warn!(
                saved = report.saved.len(),
                failed = ?report.failed_ids(),
                "batch saved with failures"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Sync & reload
    // ========================================================================

    pub async fn force_sync_all(&self) -> Result<SyncReport> {
        self.force_sync_with(SyncOptions::default()).await
    }

    /// Full bidirectional reconciliation. Requires a signed-in session with
    /// no migration decision outstanding.
    pub async fn force_sync_with(&self, opts: SyncOptions) -> Result<SyncReport> {
        self.ensure_initialized()?;
        let (authenticated, pending) = {
            let state = self.state.lock();
            (state.authenticated, state.pending_migration)
        };
        if !authenticated {
            return Err(PersistError::NotAuthenticated);
        }
        if pending.is_some() {
            return Err(PersistError::MigrationPending);
        }

        let _guard = self.transition.lock().await;
        self.mirror.wait_idle().await;
        let started = Utc::now();
        let writes_before = Counters::get(&self.counters.writes);
        let cancel = self.cancel_token();
        let report = self.sync.force_sync_all(&opts, &cancel).await?;
        let settled = self.settled_cursor(started, &report, writes_before).await;
        self.record_sync(settled).await;
        Counters::bump(&self.counters.syncs);
        Ok(report)
    }

    /// Whether either store changed since the last reconciliation.
    pub async fn is_sync_required(&self) -> Result<bool> {
        self.ensure_initialized()?;
        let (authenticated, cursor) = {
            let state = self.state.lock();
            (state.authenticated, state.cursor)
        };
        if !authenticated {
            return Ok(false);
        }
        self.sync
            .is_sync_required(&cursor)
            .await
            .map_err(PersistError::Sync)
    }

    /// Re-read every live list and item from the routed store(s).
    pub async fn force_reload_from_persistence(&self) -> Result<Snapshot> {
        self.ensure_initialized()?;
        let op = Operation::ForceReload;
        let lists = self
            .read_routed(op, None, |store| async move { store.get_all_lists().await })
            .await?;
        let mut items = self
            .read_routed(op, None, |store| async move { store.get_all_items().await })
            .await?;
        let live: HashSet<&str> = lists.iter().map(|l| l.id.as_str()).collect();
        items.retain(|i| live.contains(i.list_id.as_str()));
        tracing::info!(lists = lists.len(), items = items.len(), "reloaded from persistence");
        Ok(Snapshot { lists, items })
    }

    // ========================================================================
    // Routing
    // ========================================================================

    async fn read_routed<T, F, Fut>(&self, operation: Operation, id: Option<&str>, fetch: F) -> Result<Vec<T>>
    where
        T: Versioned + Clone + PartialEq,
        F: Fn(Arc<dyn RecordStore>) -> Fut,
        Fut: Future<Output = StoreResult<Vec<T>>>,
    {
        let mode = self.mode();
        let fail = |e| PersistError::store(operation, id, mode, e);
        Counters::bump(&self.counters.reads);

        let records = match mode {
            PersistenceMode::LocalOnly => fetch(self.local.clone()).await.map_err(fail)?,
            PersistenceMode::CloudWithLocalBackup => match fetch(self.remote.clone()).await {
                Ok(records) => records,
                Err(e) if e.is_transient() => {
                    if !self.local.is_available().await {
                        return Err(fail(e));
                    }
                    self.note_fallback(operation, &e);
                    fetch(self.local.clone()).await.map_err(fail)?
                }
                Err(e) => return Err(fail(e)),
            },
            PersistenceMode::Hybrid => {
                let (local, remote) = tokio::join!(fetch(self.local.clone()), fetch(self.remote.clone()));
                match (local, remote) {
                    (Ok(local), Ok(remote)) => merge_records(local, remote),
                    (Ok(records), Err(e)) | (Err(e), Ok(records)) if e.is_transient() => {
                        self.note_fallback(operation, &e);
                        records
                    }
                    (Err(e), _) | (_, Err(e)) => return Err(fail(e)),
                }
            }
        };

        let mut records = dedupe(records);
        records.retain(|r| !r.is_tombstone());
        Ok(records)
    }

    async fn write(&self, operation: Operation, record: Record) -> Result<WriteOutcome> {
        match self.gate.admit(PendingWrite { operation, record }) {
            Admission::Queued => {
                Counters::bump(&self.counters.queued_writes);
                tracing::info!(%operation, "write queued until migration completes");
                Ok(WriteOutcome::Queued)
            }
            Admission::Proceed(write) => self.route_write(write.operation, write.record).await,
        }
    }

    async fn route_write(&self, operation: Operation, record: Record) -> Result<WriteOutcome> {
        let mode = self.mode();
        let id = record.id().to_string();
        let fail = |e| PersistError::store(operation, Some(&id), mode, e);
        Counters::bump(&self.counters.writes);

        match mode {
            PersistenceMode::LocalOnly => {
                self.upsert(self.local.as_ref(), operation, &record)
                    .await
                    .map_err(fail)?;
                Ok(WriteOutcome::Applied)
            }
            PersistenceMode::CloudWithLocalBackup => {
                match self.upsert(self.remote.as_ref(), operation, &record).await {
                    Ok(()) => {
                        self.mirror.enqueue(record);
                        Ok(WriteOutcome::Applied)
                    }
                    Err(e) if e.is_transient() => {
                        self.note_fallback(operation, &e);
                        // Serialized with queued mirror jobs for this record.
                        let _turn = self.mirror.hold(&id).await;
                        self.upsert(self.local.as_ref(), operation, &record)
                            .await
                            .map_err(fail)?;
                        Ok(WriteOutcome::Applied)
                    }
                    Err(e) => Err(fail(e)),
                }
            }
            PersistenceMode::Hybrid => {
                // Cloud first: a denied write must not leave a local copy
                // that hybrid reads would merge back in.
                let remote = match self.upsert(self.remote.as_ref(), operation, &record).await {
                    Err(e) if e.is_permission_denied() => return Err(fail(e)),
                    other => other,
                };
                let local = self.upsert(self.local.as_ref(), operation, &record).await;
                let (failed, error) = match (local, remote) {
                    (Ok(()), Ok(())) => return Ok(WriteOutcome::Applied),
                    (Err(_), Err(e)) => return Err(fail(e)),
                    (Ok(()), Err(e)) => (StoreSide::Cloud, e),
                    (Err(e), Ok(())) => (StoreSide::Local, e),
                };
                Counters::bump(&self.counters.partial_failures);
                tracing::warn!(%operation, id = %id, side = %failed, error = %error, "write reached only one store");
                Ok(WriteOutcome::Partial { failed, error })
            }
        }
    }

    /// Write through the store's upsert primitive, noting saves that landed
    /// on an existing record.
    async fn upsert(&self, store: &dyn RecordStore, operation: Operation, record: &Record) -> StoreResult<()> {
        let replaced = upsert_record(store, record).await?;
        if replaced
            && matches!(
                operation,
                Operation::SaveList | Operation::SaveItem | Operation::SaveMultipleItems
            )
        {
            Counters::bump(&self.counters.upsert_conversions);
            tracing::debug!(store = store.name(), %operation, id = record.id(), "existing record, applied as update");
        }
        Ok(())
    }

    // ========================================================================
    // Migration
    // ========================================================================

    /// Caller holds the transition lock.
    async fn run_migration(&self, strategy: MigrationStrategy) -> Result<TransitionOutcome> {
        let cancel = self.cancel_token();

        if strategy == MigrationStrategy::AskUser {
            self.migration.migrate_data(strategy, None, &cancel).await?;
            self.state.lock().mode = PersistenceMode::LocalOnly;
            self.mark_pending(Some(strategy)).await;
            return Ok(TransitionOutcome::AwaitingDecision);
        }

        self.gate.close();
        let started = Utc::now();
        let progress = self.migration_progress.lock().clone();
        let result = self
            .migration
            .migrate_data(strategy, progress.as_ref(), &cancel)
            .await;

        let outcome = match result {
            Ok(MigrationOutcome::Completed(report)) => {
                self.state.lock().mode = PersistenceMode::CloudWithLocalBackup;
                self.mark_pending(None).await;
                if report.stores_converged() {
                    self.record_sync(started).await;
                }
                Counters::bump(&self.counters.migrations);
                Ok(TransitionOutcome::Migrated(report))
            }
            Ok(MigrationOutcome::AwaitingDecision) => Ok(TransitionOutcome::AwaitingDecision),
            Err(e) => {
                // Stay local; the same or another strategy can be retried.
                self.state.lock().mode = PersistenceMode::LocalOnly;
                self.mark_pending(Some(strategy)).await;
                Err(PersistError::Migration(e))
            }
        };

        self.replay_queued().await;
        outcome
    }

    async fn replay_queued(&self) {
        loop {
            let parked = self.gate.drain_or_open();
            if parked.is_empty() {
                break;
            }
            tracing::info!(count = parked.len(), "replaying writes queued during migration");
            for write in parked {
                let operation = write.operation;
                let id = write.record.id().to_string();
                match self.route_write(operation, write.record).await {
                    Ok(_) => Counters::bump(&self.counters.replayed_writes),
                    Err(e) => tracing::warn!(%operation, id = %id, error = %e, "queued write failed on replay"),
                }
            }
        }
    }

    async fn mark_pending(&self, strategy: Option<MigrationStrategy>) {
        self.state.lock().pending_migration = strategy;
        let persisted = match strategy {
            Some(s) => self.local.set_meta(META_PENDING_MIGRATION, &encode_strategy(s)).await,
            None => self.local.remove_meta(META_PENDING_MIGRATION).await,
        };
        if let Err(e) = persisted {
            tracing::warn!(error = %e, "failed to persist migration marker");
        }
    }

    /// Cursor for a finished pass. The pass's own writes move the store
    /// watermarks past `started`; those are absorbed when no caller write went
    /// through this coordinator meanwhile, so the next check does not ask for
    /// a redundant pass.
    async fn settled_cursor(&self, started: DateTime<Utc>, report: &SyncReport, writes_before: u64) -> DateTime<Utc> {
        if report.writes() == 0 || Counters::get(&self.counters.writes) != writes_before || self.mirror.pending() > 0 {
            return started;
        }
        match self.sync.watermark().await {
            Ok(Some(mark)) => mark.max(started),
            Ok(None) => started,
            Err(e) => {
                tracing::debug!(error = %e, "watermark unavailable, cursor kept at sync start");
                started
            }
        }
    }

    async fn record_sync(&self, at: DateTime<Utc>) {
        self.state.lock().cursor = SyncCursor::at(at);
        if let Err(e) = self.local.set_meta(META_SYNC_CURSOR, &encode_cursor(at)).await {
            tracing::warn!(error = %e, "failed to persist sync cursor");
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn ensure_initialized(&self) -> Result<()> {
        if self.state.lock().initialized {
            Ok(())
        } else {
            Err(PersistError::NotInitialized)
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    fn validated(&self, record: Record) -> Result<Record> {
        match record.validate() {
            Ok(()) => Ok(record),
            Err(issue) => {
                Counters::bump(&self.counters.validation_failures);
                tracing::debug!(%issue, "record rejected");
                Err(PersistError::Validation(vec![issue]))
            }
        }
    }

    async fn ensure_parent(&self, operation: Operation, item: &ItemRecord) -> Result<()> {
        if item.list_id.is_empty()
            || self.gate.holds(RecordKind::List, &item.list_id)
            || self.find_list(operation, &item.list_id).await?.is_some()
        {
            // An empty parent is reported by structural validation.
            return Ok(());
        }
        Counters::bump(&self.counters.validation_failures);
        Err(PersistError::Validation(vec![ValidationIssue {
            kind: RecordKind::Item,
            id: item.id.clone(),
            reason: ValidationReason::DanglingList(item.list_id.clone()),
        }]))
    }

    async fn find_list(&self, operation: Operation, id: &str) -> Result<Option<ListRecord>> {
        let found = self
            .read_routed(operation, Some(id), |store| {
                let id = id.to_string();
                async move { store.get_list(&id).await.map(|l| l.into_iter().collect::<Vec<_>>()) }
            })
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_item(&self, operation: Operation, id: &str) -> Result<Option<ItemRecord>> {
        let found = self
            .read_routed(operation, Some(id), |store| {
                let id = id.to_string();
                async move { store.get_item(&id).await.map(|i| i.into_iter().collect::<Vec<_>>()) }
            })
            .await?;
        Ok(found.into_iter().next())
    }

    async fn items_of(&self, operation: Operation, list_id: &str) -> Result<Vec<ItemRecord>> {
        let mut items = self
            .read_routed(operation, Some(list_id), |store| {
                let list_id = list_id.to_string();
                async move { store.get_items_by_list(&list_id).await }
            })
            .await?;
        items.sort_by(|a, b| b.rank.total_cmp(&a.rank).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    fn not_found(&self, operation: Operation, kind: RecordKind, id: &str) -> PersistError {
        PersistError::store(
            operation,
            Some(id),
            self.mode(),
            StoreError::NotFound {
                kind,
                id: id.to_string(),
            },
        )
    }

    fn note_fallback(&self, operation: Operation, error: &StoreError) {
        Counters::bump(&self.counters.fallbacks);
        tracing::warn!(%operation, error = %error, "cloud unavailable, using local store");
    }
}
