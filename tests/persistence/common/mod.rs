//! Shared fixtures: a fault-injecting store and coordinator builders.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use listsync::{
    CoordinatorOptions, ItemRecord, ListRecord, MemoryStore, PersistenceCoordinator, RecordStore,
    Snapshot, StoreError, StoreResult,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn list_at(id: &str, title: &str, secs: i64) -> ListRecord {
    let mut list = ListRecord::new("user-1", title);
    list.id = id.to_string();
    list.created_at = at(0);
    list.updated_at = at(secs);
    list
}

pub fn item_in(list_id: &str, id: &str, title: &str) -> ItemRecord {
    let mut item = ItemRecord::new(list_id, title);
    item.id = id.to_string();
    item
}

// ============================================================================
// FaultyStore
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    PermissionDenied,
    Unknown,
}

impl Fault {
    fn error(self) -> StoreError {
        match self {
            Self::Unreachable => StoreError::Unreachable("connection reset".into()),
            Self::PermissionDenied => StoreError::PermissionDenied("row-level policy".into()),
            Self::Unknown => StoreError::Unknown("internal server error".into()),
        }
    }
}

/// `MemoryStore` with switchable failures and latency.
pub struct FaultyStore {
    inner: MemoryStore,
    read_fault: Mutex<Option<Fault>>,
    write_fault: Mutex<Option<Fault>>,
    failing_ids: Mutex<HashSet<String>>,
    read_delay: Mutex<Option<Duration>>,
    write_delay: Mutex<Option<Duration>>,
    writes: AtomicUsize,
}

impl FaultyStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryStore::new(name),
            read_fault: Mutex::new(None),
            write_fault: Mutex::new(None),
            failing_ids: Mutex::new(HashSet::new()),
            read_delay: Mutex::new(None),
            write_delay: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn fail_reads(&self, fault: Fault) {
        *self.read_fault.lock() = Some(fault);
    }

    pub fn fail_writes(&self, fault: Fault) {
        *self.write_fault.lock() = Some(fault);
    }

    /// Reject writes of one record with `PermissionDenied`.
    pub fn fail_writes_for(&self, id: &str) {
        self.failing_ids.lock().insert(id.to_string());
    }

    pub fn slow_reads(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    pub fn slow_writes(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }

    pub fn heal(&self) {
        *self.read_fault.lock() = None;
        *self.write_fault.lock() = None;
        self.failing_ids.lock().clear();
        *self.read_delay.lock() = None;
        *self.write_delay.lock() = None;
    }

    /// Seed without going through fault checks.
    pub async fn seed_list(&self, list: &ListRecord) {
        self.inner.upsert_list(list).await.unwrap();
    }

    pub async fn seed_item(&self, item: &ItemRecord) {
        self.inner.upsert_item(item).await.unwrap();
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn check_read(&self) -> StoreResult<()> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match *self.read_fault.lock() {
            Some(fault) => Err(fault.error()),
            None => Ok(()),
        }
    }

    async fn check_write(&self, id: &str) -> StoreResult<()> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = *self.write_fault.lock() {
            return Err(fault.error());
        }
        if self.failing_ids.lock().contains(id) {
            return Err(Fault::PermissionDenied.error());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_all_lists(&self) -> StoreResult<Vec<ListRecord>> {
        self.check_read().await?;
        self.inner.get_all_lists().await
    }

    async fn get_list(&self, id: &str) -> StoreResult<Option<ListRecord>> {
        self.check_read().await?;
        self.inner.get_list(id).await
    }

    async fn save_list(&self, list: &ListRecord) -> StoreResult<()> {
        self.check_write(&list.id).await?;
        self.inner.save_list(list).await
    }

    async fn update_list(&self, list: &ListRecord) -> StoreResult<()> {
        self.check_write(&list.id).await?;
        self.inner.update_list(list).await
    }

    async fn delete_list(&self, id: &str) -> StoreResult<()> {
        self.check_write(id).await?;
        self.inner.delete_list(id).await
    }

    async fn get_all_items(&self) -> StoreResult<Vec<ItemRecord>> {
        self.check_read().await?;
        self.inner.get_all_items().await
    }

    async fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<ItemRecord>> {
        self.check_read().await?;
        self.inner.get_items_by_list(list_id).await
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<ItemRecord>> {
        self.check_read().await?;
        self.inner.get_item(id).await
    }

    async fn save_item(&self, item: &ItemRecord) -> StoreResult<()> {
        self.check_write(&item.id).await?;
        self.inner.save_item(item).await
    }

    async fn update_item(&self, item: &ItemRecord) -> StoreResult<()> {
        self.check_write(&item.id).await?;
        self.inner.update_item(item).await
    }

    async fn delete_item(&self, id: &str) -> StoreResult<()> {
        self.check_write(id).await?;
        self.inner.delete_item(id).await
    }

    async fn is_available(&self) -> bool {
        self.read_fault.lock().is_none()
    }

    async fn last_modified(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.last_modified().await
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get_meta(key).await
    }

    async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.set_meta(key, value).await
    }

    async fn remove_meta(&self, key: &str) -> StoreResult<()> {
        self.inner.remove_meta(key).await
    }

    async fn upsert_list(&self, list: &ListRecord) -> StoreResult<bool> {
        self.check_write(&list.id).await?;
        self.inner.upsert_list(list).await
    }

    async fn upsert_item(&self, item: &ItemRecord) -> StoreResult<bool> {
        self.check_write(&item.id).await?;
        self.inner.upsert_item(item).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub local: Arc<FaultyStore>,
    pub remote: Arc<FaultyStore>,
    pub coordinator: Arc<PersistenceCoordinator>,
}

impl Harness {
    /// Fresh stores, not yet initialized.
    pub fn new(options: CoordinatorOptions) -> Self {
        init_tracing();
        let local = Arc::new(FaultyStore::new("local"));
        let remote = Arc::new(FaultyStore::new("cloud"));
        Self::over(local, remote, options)
    }

    /// A coordinator over existing stores, e.g. to simulate an app restart.
    pub fn over(local: Arc<FaultyStore>, remote: Arc<FaultyStore>, options: CoordinatorOptions) -> Self {
        let coordinator = Arc::new(PersistenceCoordinator::new(
            local.clone(),
            remote.clone(),
            options,
        ));
        Self {
            local,
            remote,
            coordinator,
        }
    }

    pub async fn guest() -> Self {
        let h = Self::new(CoordinatorOptions::default());
        h.coordinator.initialize(false).await.unwrap();
        h
    }

    pub async fn signed_in() -> Self {
        let h = Self::new(CoordinatorOptions::default());
        h.coordinator.initialize(true).await.unwrap();
        h
    }
}
