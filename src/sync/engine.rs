//! SyncEngine: bidirectional reconciliation between the local and remote
//! stores.
//!
//! Both snapshots are deduplicated, merged pairwise by identifier under the
//! resolver, and the winner is written to whichever side lacks it. The remote
//! side is treated as incoming, so equal timestamps resolve in its favor. A
//! second run with no writes in between finds nothing to do.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{PersistError, Result, StoreResult};
use crate::resolve::{merge_by_id, MergeEntry};
use crate::sanitize::{dedupe, sanitize_items, sanitize_lists};
use crate::storage::{load_all, RecordStore, Upsert};
use crate::types::{RecordKind, Snapshot, SyncCursor, Versioned};

use super::types::{SyncErrorEvent, SyncOptions, SyncPhase, SyncProgress, SyncReport};

pub struct SyncEngine {
    local: Arc<dyn RecordStore>,
    remote: Arc<dyn RecordStore>,
}

impl SyncEngine {
    pub fn new(local: Arc<dyn RecordStore>, remote: Arc<dyn RecordStore>) -> Self {
        Self { local, remote }
    }

    /// True when either store changed after the cursor.
    pub async fn is_sync_required(&self, cursor: &SyncCursor) -> StoreResult<bool> {
        if cursor.is_behind(self.local.last_modified().await?) {
            return Ok(true);
        }
        Ok(cursor.is_behind(self.remote.last_modified().await?))
    }

    /// Latest mutation time across both stores.
    pub async fn watermark(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let local = self.local.last_modified().await?;
        let remote = self.remote.last_modified().await?;
        Ok(local.max(remote))
    }

    /// Reconcile both stores. Per-record write failures land in the report;
    /// a failed snapshot read or a cancellation aborts the pass.
    pub async fn force_sync_all(
        &self,
        opts: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let (local_lists, local_items) = load_all(self.local.as_ref())
            .await
            .map_err(PersistError::Sync)?;
        let (remote_lists, remote_items) = load_all(self.remote.as_ref())
            .await
            .map_err(PersistError::Sync)?;

        tracing::info!(
            local_lists = local_lists.len(),
            remote_lists = remote_lists.len(),
            local_items = local_items.len(),
            remote_items = remote_items.len(),
            "sync started"
        );

        let mut report = SyncReport::default();

        let local_lists = sanitize_lists(local_lists);
        let remote_lists = sanitize_lists(remote_lists);
        report.rejected.extend(local_lists.rejected);
        report.rejected.extend(remote_lists.rejected);
        let lists = merge_by_id(local_lists.records, remote_lists.records);

        let known: HashSet<String> = lists.iter().map(|e| e.winner.id.clone()).collect();
        let local_items = sanitize_items(local_items, &known);
        let remote_items = sanitize_items(remote_items, &known);
        report.rejected.extend(local_items.rejected);
        report.rejected.extend(remote_items.rejected);
        let items = merge_by_id(local_items.records, remote_items.records);

        let total = lists.len() + items.len();
        let mut processed = 0;

        // Lists first so items never land before their parent.
        for entry in &lists {
            if cancel.is_cancelled() {
                return Err(PersistError::Cancelled);
            }
            self.apply(entry, &mut report, opts).await;
            processed += 1;
            notify_progress(opts, RecordKind::List, processed, total);
        }
        for entry in &items {
            if cancel.is_cancelled() {
                return Err(PersistError::Cancelled);
            }
            self.apply(entry, &mut report, opts).await;
            processed += 1;
            notify_progress(opts, RecordKind::Item, processed, total);
        }

        report.completed_at = Some(Utc::now());
        tracing::info!(
            writes = report.writes(),
            conflicts = report.conflicts,
            rejected = report.rejected.len(),
            errors = report.errors.len(),
            "sync finished"
        );
        Ok(report)
    }

    /// Write one merge winner to the side(s) that need it.
    async fn apply<T: Upsert>(&self, entry: &MergeEntry<T>, report: &mut SyncReport, opts: &SyncOptions) {
        if entry.conflicted {
            report.conflicts += 1;
            tracing::debug!(kind = %T::KIND, id = %entry.winner.id(), "resolved conflict");
        }
        if entry.write_resident {
            match entry.winner.upsert_into(self.local.as_ref()).await {
                Ok(_) => match T::KIND {
                    RecordKind::List => report.lists_pulled += 1,
                    RecordKind::Item => report.items_pulled += 1,
                },
                Err(e) => record_error(report, opts, SyncPhase::Pull, T::KIND, entry.winner.id(), &e),
            }
        }
        if entry.write_incoming {
            match entry.winner.upsert_into(self.remote.as_ref()).await {
                Ok(_) => match T::KIND {
                    RecordKind::List => report.lists_pushed += 1,
                    RecordKind::Item => report.items_pushed += 1,
                },
                Err(e) => record_error(report, opts, SyncPhase::Push, T::KIND, entry.winner.id(), &e),
            }
        }
    }
}

fn record_error(
    report: &mut SyncReport,
    opts: &SyncOptions,
    phase: SyncPhase,
    kind: RecordKind,
    id: &str,
    e: &crate::error::StoreError,
) {
    tracing::warn!(?phase, %kind, id, error = %e, "sync write failed");
    let event = SyncErrorEvent::from_store(phase, kind, id, e);
    if let Some(ref cb) = opts.on_error {
        cb(&event);
    }
    report.errors.push(event);
}

fn notify_progress(opts: &SyncOptions, record: RecordKind, processed: usize, total: usize) {
    if let Some(ref cb) = opts.on_progress {
        cb(&SyncProgress {
            record,
            processed,
            total,
        });
    }
}

/// Merge two snapshots in memory without writing anything back.
///
/// Used to serve reads when both stores are live. Tombstones are kept so the
/// caller decides whether to show them.
pub fn merge_snapshots(local: Snapshot, remote: Snapshot) -> Snapshot {
    Snapshot {
        lists: merge_records(local.lists, remote.lists),
        items: merge_records(local.items, remote.items),
    }
}

pub fn merge_records<T>(local: Vec<T>, remote: Vec<T>) -> Vec<T>
where
    T: Versioned + Clone + PartialEq,
{
    merge_by_id(dedupe(local), dedupe(remote))
        .into_iter()
        .map(|e| e.winner)
        .collect()
}
