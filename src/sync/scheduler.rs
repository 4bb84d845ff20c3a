//! Background sync: periodically checks whether the stores drifted and runs
//! a full reconciliation when they did.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::PersistenceCoordinator;
use crate::error::PersistError;

/// Handle to the background sync task. The task holds only a weak reference,
/// so dropping the coordinator also ends it.
pub struct SyncScheduler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start checking every `period`. Must be called inside a Tokio runtime.
    pub fn spawn(coordinator: &Arc<PersistenceCoordinator>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::downgrade(coordinator), period, cancel.child_token()));
        Self { cancel, handle }
    }

    /// Start with the coordinator's configured `sync_interval_ms`.
    pub fn spawn_default(coordinator: &Arc<PersistenceCoordinator>) -> Self {
        let period = coordinator.options().sync_interval();
        Self::spawn(coordinator, period)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "sync scheduler task failed");
        }
    }
}

async fn run(coordinator: Weak<PersistenceCoordinator>, period: Duration, cancel: CancellationToken) {
    tracing::info!(period_ms = period.as_millis() as u64, "sync scheduler started");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        tick(&coordinator).await;
    }

    tracing::info!("sync scheduler stopped");
}

async fn tick(coordinator: &PersistenceCoordinator) {
    match coordinator.is_sync_required().await {
        Ok(false) => {}
        Ok(true) => match coordinator.force_sync_all().await {
            Ok(report) => tracing::debug!(
                writes = report.writes(),
                conflicts = report.conflicts,
                errors = report.errors.len(),
                "background sync finished"
            ),
            // Signed out or awaiting a migration decision; try again next tick.
            Err(PersistError::NotAuthenticated | PersistError::MigrationPending) => {}
            Err(e) => tracing::warn!(error = %e, "background sync failed"),
        },
        Err(e) => tracing::warn!(error = %e, "sync check failed"),
    }
}
