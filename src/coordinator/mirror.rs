//! Background mirror of cloud writes into the local store.
//!
//! Bounded queues drained by a fixed pool of workers. Jobs are sharded by
//! record id so writes to one record are applied in order. A job never
//! replaces a newer version already in the target; writers that bypass the
//! queue take the record's shard with [`Mirror::hold`]. Enqueueing never
//! waits: a full shard drops the job and counts it. Failures are logged and
//! kept in a short ring for `get_persistence_stats`.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, MutexGuard, Notify};

use crate::error::StoreResult;
use crate::resolve::{pick, Winner};
use crate::storage::{upsert_record, RecordStore};
use crate::types::{Record, RecordKind};

use super::stats::{Counters, MirrorCounters};

#[derive(Debug, Clone, Serialize)]
pub struct MirrorFailure {
    pub record: RecordKind,
    pub id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

struct Shared {
    target: Arc<dyn RecordStore>,
    /// One per shard, held while a write to that shard's records is applied.
    turns: Vec<tokio::sync::Mutex<()>>,
    pending: AtomicUsize,
    idle: Notify,
    counters: MirrorCounters,
    failures: Mutex<VecDeque<MirrorFailure>>,
    failure_log: usize,
}

impl Shared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn record_failure(&self, failure: MirrorFailure) {
        Counters::bump(&self.counters.failed);
        let mut log = self.failures.lock();
        if log.len() == self.failure_log {
            log.pop_front();
        }
        if self.failure_log > 0 {
            log.push_back(failure);
        }
    }
}

pub(crate) struct Mirror {
    shards: Vec<mpsc::Sender<Record>>,
    receivers: Mutex<Vec<mpsc::Receiver<Record>>>,
    started: AtomicBool,
    shared: Arc<Shared>,
}

impl Mirror {
    /// `capacity` is split evenly across `workers` shards.
    pub fn new(target: Arc<dyn RecordStore>, capacity: usize, workers: usize, failure_log: usize) -> Self {
        let workers = workers.max(1);
        let per_shard = (capacity / workers).max(1);
        let (shards, receivers): (Vec<_>, Vec<_>) = (0..workers).map(|_| mpsc::channel(per_shard)).unzip();
        Self {
            shards,
            receivers: Mutex::new(receivers),
            started: AtomicBool::new(false),
            shared: Arc::new(Shared {
                target,
                turns: (0..workers).map(|_| tokio::sync::Mutex::new(())).collect(),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                counters: MirrorCounters::default(),
                failures: Mutex::new(VecDeque::new()),
                failure_log,
            }),
        }
    }

    /// Spawn the worker pool. Must run inside a Tokio runtime; later calls
    /// are no-ops. Workers exit once the mirror is dropped.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let receivers = std::mem::take(&mut *self.receivers.lock());
        for (worker, mut rx) in receivers.into_iter().enumerate() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    let applied = {
                        let _turn = shared.turns[worker].lock().await;
                        apply_unless_stale(shared.target.as_ref(), &record).await
                    };
                    match applied {
                        Ok(true) => Counters::bump(&shared.counters.completed),
                        Ok(false) => {
                            tracing::debug!(
                                worker,
                                kind = %record.kind(),
                                id = record.id(),
                                "local copy is newer, mirror write skipped"
                            );
                            Counters::bump(&shared.counters.completed);
                            Counters::bump(&shared.counters.superseded);
                        }
                        Err(e) => {
                            tracing::warn!(
                                worker,
                                kind = %record.kind(),
                                id = record.id(),
                                error = %e,
                                "local mirror write failed"
                            );
                            shared.record_failure(MirrorFailure {
                                record: record.kind(),
                                id: record.id().to_string(),
                                error: e.to_string(),
                                at: Utc::now(),
                            });
                        }
                    }
                    shared.finish_one();
                }
                tracing::debug!(worker, "mirror worker stopped");
            });
        }
    }

    /// Queue a record for the local store. Returns `false` if it was dropped.
    pub fn enqueue(&self, record: Record) -> bool {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let shard = &self.shards[shard_of(record.id(), self.shards.len())];
        match shard.try_send(record) {
            Ok(()) => {
                Counters::bump(&self.shared.counters.enqueued);
                true
            }
            Err(e) => {
                let record = match e {
                    mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
                };
                tracing::warn!(kind = %record.kind(), id = record.id(), "mirror queue full, write dropped");
                Counters::bump(&self.shared.counters.dropped);
                self.shared.finish_one();
                false
            }
        }
    }

    /// Take the shard that owns `id`. Direct writes to the target made while
    /// holding it cannot interleave with a queued job for the same record.
    pub async fn hold(&self, id: &str) -> MutexGuard<'_, ()> {
        self.shared.turns[shard_of(id, self.shards.len())].lock().await
    }

    /// Resolve once every queued job has been attempted.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> &MirrorCounters {
        &self.shared.counters
    }

    pub fn recent_failures(&self) -> Vec<MirrorFailure> {
        self.shared.failures.lock().iter().cloned().collect()
    }
}

/// Returns `false` when the target already holds a newer version.
async fn apply_unless_stale(target: &dyn RecordStore, record: &Record) -> StoreResult<bool> {
    let stale = match record {
        Record::List(list) => target
            .get_list(&list.id)
            .await?
            .is_some_and(|resident| pick(&resident, list) == Winner::Resident),
        Record::Item(item) => target
            .get_item(&item.id)
            .await?
            .is_some_and(|resident| pick(&resident, item) == Winner::Resident),
    };
    if stale {
        return Ok(false);
    }
    upsert_record(target, record).await?;
    Ok(true)
}

fn shard_of(id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
