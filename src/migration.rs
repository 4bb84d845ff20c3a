//! MigrationEngine: moves a dataset between the local and remote stores
//! when a session switches from guest to authenticated.
//!
//! State machine: `Idle → Running → Completed | Failed`, plus the terminal
//! `AwaitingDecision` for `AskUser`. Migration is not transactional: a failure
//! keeps whatever was already written and the whole run can be repeated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{MigrationError, MigrationFailure};
use crate::resolve::{merge_by_id, pick, MergeEntry, Winner};
use crate::sanitize::{sanitize_items, sanitize_lists};
use crate::storage::{load_all, RecordStore, Upsert};
use crate::types::{ItemRecord, ListRecord, MigrationStrategy, ValidationIssue, Versioned};

// ============================================================================
// State & progress
// ============================================================================

/// Progress payload: `(total, completed, current operation)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub total: usize,
    pub completed: usize,
    pub current_operation: String,
}

pub type MigrationProgressCallback = Arc<dyn Fn(&MigrationProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    Running {
        strategy: MigrationStrategy,
        progress: MigrationProgress,
    },
    /// `AskUser` was requested; nothing moves until a concrete strategy arrives.
    AwaitingDecision,
    Completed(MigrationReport),
    Failed {
        strategy: MigrationStrategy,
        error: String,
        progress: MigrationProgress,
    },
}

impl MigrationState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running { .. } => "running",
            Self::AwaitingDecision => "awaiting_decision",
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a completed migration did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub strategy: MigrationStrategy,
    /// Records written to the remote store.
    pub cloud_writes: usize,
    /// Records written to the local store.
    pub local_writes: usize,
    /// Local records left alone because the cloud already had the same or newer.
    pub skipped: usize,
    /// Local records removed (`CloudOnly` only).
    pub discarded: usize,
    pub conflicts: usize,
    pub rejected: Vec<ValidationIssue>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationReport {
    fn new(strategy: MigrationStrategy) -> Self {
        Self {
            strategy,
            cloud_writes: 0,
            local_writes: 0,
            skipped: 0,
            discarded: 0,
            conflicts: 0,
            rejected: Vec::new(),
            finished_at: None,
        }
    }

    /// Whether both stores hold the same dataset afterwards.
    pub fn stores_converged(&self) -> bool {
        matches!(
            self.strategy,
            MigrationStrategy::CloudOnly | MigrationStrategy::IntelligentMerge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    Completed(MigrationReport),
    AwaitingDecision,
}

// ============================================================================
// Run: bookkeeping for one migration
// ============================================================================

struct Run<'a> {
    state: &'a Mutex<MigrationState>,
    strategy: MigrationStrategy,
    progress: MigrationProgress,
    on_progress: Option<&'a MigrationProgressCallback>,
    cancel: &'a CancellationToken,
    report: MigrationReport,
}

impl Run<'_> {
    fn set_total(&mut self, total: usize) {
        self.progress.total = total;
        self.publish();
    }

    /// Checked before every record write; a single write is never interrupted.
    fn begin(&mut self, operation: String) -> Result<(), MigrationFailure> {
        if self.cancel.is_cancelled() {
            return Err(MigrationFailure::Cancelled);
        }
        self.progress.current_operation = operation;
        self.publish();
        Ok(())
    }

    fn done(&mut self) {
        self.progress.completed += 1;
        self.publish();
    }

    fn publish(&self) {
        *self.state.lock() = MigrationState::Running {
            strategy: self.strategy,
            progress: self.progress.clone(),
        };
        if let Some(cb) = self.on_progress {
            cb(&self.progress);
        }
    }
}

// ============================================================================
// MigrationEngine
// ============================================================================

pub struct MigrationEngine {
    local: Arc<dyn RecordStore>,
    remote: Arc<dyn RecordStore>,
    state: Mutex<MigrationState>,
}

impl MigrationEngine {
    pub fn new(local: Arc<dyn RecordStore>, remote: Arc<dyn RecordStore>) -> Self {
        Self {
            local,
            remote,
            state: Mutex::new(MigrationState::Idle),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state.lock().clone()
    }

    /// Run a migration. Callers serialize runs; a second concurrent run on the
    /// same engine would interleave its progress with the first.
    pub async fn migrate_data(
        &self,
        strategy: MigrationStrategy,
        on_progress: Option<&MigrationProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<MigrationOutcome, MigrationError> {
        if strategy == MigrationStrategy::AskUser {
            tracing::info!("migration awaiting user decision");
            *self.state.lock() = MigrationState::AwaitingDecision;
            return Ok(MigrationOutcome::AwaitingDecision);
        }

        tracing::info!(%strategy, "migration started");
        let mut run = Run {
            state: &self.state,
            strategy,
            progress: MigrationProgress::default(),
            on_progress,
            cancel,
            report: MigrationReport::new(strategy),
        };
        run.publish();

        let result = match strategy {
            MigrationStrategy::MigrateAllToCloud => self.migrate_all_to_cloud(&mut run).await,
            MigrationStrategy::CloudOnly => self.cloud_only(&mut run).await,
            MigrationStrategy::IntelligentMerge => self.intelligent_merge(&mut run).await,
            MigrationStrategy::AskUser => Ok(()),
        };

        match result {
            Ok(()) => {
                let mut report = run.report;
                report.finished_at = Some(Utc::now());
                tracing::info!(
                    %strategy,
                    cloud_writes = report.cloud_writes,
                    local_writes = report.local_writes,
                    skipped = report.skipped,
                    discarded = report.discarded,
                    "migration completed"
                );
                *self.state.lock() = MigrationState::Completed(report.clone());
                Ok(MigrationOutcome::Completed(report))
            }
            Err(cause) => {
                let progress = run.progress;
                tracing::warn!(
                    %strategy,
                    completed = progress.completed,
                    total = progress.total,
                    error = %cause,
                    "migration failed, already-migrated records kept"
                );
                *self.state.lock() = MigrationState::Failed {
                    strategy,
                    error: cause.to_string(),
                    progress: progress.clone(),
                };
                Err(MigrationError {
                    completed: progress.completed,
                    total: progress.total,
                    cause,
                })
            }
        }
    }

    /// Copy every local record to the cloud unless the cloud already holds
    /// the same or a newer version. Local copies stay as a backup.
    async fn migrate_all_to_cloud(&self, run: &mut Run<'_>) -> Result<(), MigrationFailure> {
        let (lists, items) = load_all(self.local.as_ref()).await?;
        let (cloud_lists, cloud_items) = load_all(self.remote.as_ref()).await?;

        let lists = sanitize_lists(lists);
        let known: HashSet<String> = lists
            .records
            .iter()
            .map(|l| l.id.clone())
            .chain(cloud_lists.iter().map(|l| l.id.clone()))
            .collect();
        let items = sanitize_items(items, &known);
        run.report.rejected.extend(lists.rejected);
        run.report.rejected.extend(items.rejected);
        run.set_total(lists.records.len() + items.records.len());

        let cloud_lists = index_by_id(cloud_lists);
        let cloud_items = index_by_id(cloud_items);
        for list in &lists.records {
            self.copy_to_cloud(run, list, cloud_lists.get(&list.id)).await?;
        }
        for item in &items.records {
            self.copy_to_cloud(run, item, cloud_items.get(&item.id)).await?;
        }
        Ok(())
    }

    async fn copy_to_cloud<T>(
        &self,
        run: &mut Run<'_>,
        record: &T,
        in_cloud: Option<&T>,
    ) -> Result<(), MigrationFailure>
    where
        T: Upsert + PartialEq,
    {
        run.begin(format!("uploading {} {}", T::KIND, record.id()))?;
        match in_cloud {
            Some(cloud) if cloud == record || pick(cloud, record) == Winner::Resident => {
                run.report.skipped += 1;
            }
            _ => {
                record.upsert_into(self.remote.as_ref()).await?;
                run.report.cloud_writes += 1;
            }
        }
        run.done();
        Ok(())
    }

    /// Replace local data with the cloud copy. The cloud snapshot is read
    /// before anything local is touched, so an outage never discards data.
    async fn cloud_only(&self, run: &mut Run<'_>) -> Result<(), MigrationFailure> {
        let (cloud_lists, cloud_items) = load_all(self.remote.as_ref()).await?;
        let (local_lists, local_items) = load_all(self.local.as_ref()).await?;

        let keep_lists: HashSet<&str> = cloud_lists.iter().map(|l| l.id.as_str()).collect();
        let keep_items: HashSet<&str> = cloud_items.iter().map(|i| i.id.as_str()).collect();
        let drop_items: Vec<&ItemRecord> = local_items
            .iter()
            .filter(|i| !keep_items.contains(i.id.as_str()))
            .collect();
        let drop_lists: Vec<&ListRecord> = local_lists
            .iter()
            .filter(|l| !keep_lists.contains(l.id.as_str()))
            .collect();
        run.set_total(drop_items.len() + drop_lists.len() + cloud_lists.len() + cloud_items.len());

        for item in drop_items {
            run.begin(format!("discarding local item {}", item.id))?;
            self.local.delete_item(&item.id).await?;
            run.report.discarded += 1;
            run.done();
        }
        for list in drop_lists {
            run.begin(format!("discarding local list {}", list.id))?;
            self.local.delete_list(&list.id).await?;
            run.report.discarded += 1;
            run.done();
        }

        let local_lists = index_by_id(local_lists);
        let local_items = index_by_id(local_items);
        for list in &cloud_lists {
            self.copy_to_local(run, list, local_lists.get(&list.id)).await?;
        }
        for item in &cloud_items {
            self.copy_to_local(run, item, local_items.get(&item.id)).await?;
        }
        Ok(())
    }

    async fn copy_to_local<T>(
        &self,
        run: &mut Run<'_>,
        record: &T,
        local: Option<&T>,
    ) -> Result<(), MigrationFailure>
    where
        T: Upsert + PartialEq,
    {
        run.begin(format!("downloading {} {}", T::KIND, record.id()))?;
        if local != Some(record) {
            if local.is_some() {
                run.report.discarded += 1;
            }
            record.upsert_into(self.local.as_ref()).await?;
            run.report.local_writes += 1;
        }
        run.done();
        Ok(())
    }

    /// Union both datasets; per identifier the resolver picks the winner and
    /// it is written to whichever side differs. Local is the incoming side.
    async fn intelligent_merge(&self, run: &mut Run<'_>) -> Result<(), MigrationFailure> {
        let (local_lists, local_items) = load_all(self.local.as_ref()).await?;
        let (cloud_lists, cloud_items) = load_all(self.remote.as_ref()).await?;

        let local_lists = sanitize_lists(local_lists);
        let cloud_lists = sanitize_lists(cloud_lists);
        run.report.rejected.extend(local_lists.rejected);
        run.report.rejected.extend(cloud_lists.rejected);
        let lists = merge_by_id(cloud_lists.records, local_lists.records);

        let known: HashSet<String> = lists.iter().map(|e| e.winner.id.clone()).collect();
        let local_items = sanitize_items(local_items, &known);
        let cloud_items = sanitize_items(cloud_items, &known);
        run.report.rejected.extend(local_items.rejected);
        run.report.rejected.extend(cloud_items.rejected);
        let items = merge_by_id(cloud_items.records, local_items.records);

        run.set_total(lists.len() + items.len());
        for entry in &lists {
            self.write_merged(run, entry).await?;
        }
        for entry in &items {
            self.write_merged(run, entry).await?;
        }
        Ok(())
    }

    async fn write_merged<T: Upsert>(
        &self,
        run: &mut Run<'_>,
        entry: &MergeEntry<T>,
    ) -> Result<(), MigrationFailure> {
        run.begin(format!("merging {} {}", T::KIND, entry.winner.id()))?;
        if entry.conflicted {
            run.report.conflicts += 1;
        }
        // Resident side is the cloud here.
        if entry.write_resident {
            entry.winner.upsert_into(self.remote.as_ref()).await?;
            run.report.cloud_writes += 1;
        }
        if entry.write_incoming {
            entry.winner.upsert_into(self.local.as_ref()).await?;
            run.report.local_writes += 1;
        }
        run.done();
        Ok(())
    }
}

fn index_by_id<T: Versioned>(records: Vec<T>) -> HashMap<String, T> {
    records
        .into_iter()
        .map(|r| (r.id().to_string(), r))
        .collect()
}
