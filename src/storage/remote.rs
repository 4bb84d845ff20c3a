//! RemoteStore<S> — wraps a network backend with a bounded timeout and a
//! bounded retry for transient failures.
//!
//! A timeout is reported as `Unreachable`. `PermissionDenied` and `NotFound`
//! are returned on the first attempt; they describe policy or data, not a
//! transient fault.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RemoteOptions;
use crate::error::{StoreError, StoreResult};
use crate::types::{ItemRecord, ListRecord, RecordKind};

use super::traits::RecordStore;

pub struct RemoteStore<S: RecordStore> {
    inner: S,
    opts: RemoteOptions,
}

impl<S: RecordStore> RemoteStore<S> {
    pub fn new(inner: S, opts: RemoteOptions) -> Self {
        Self { inner, opts }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn options(&self) -> &RemoteOptions {
        &self.opts
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.opts.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unreachable(format!(
                    "{op} timed out after {}ms",
                    self.opts.timeout.as_millis()
                ))),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.opts.retries => {
                    let delay = self.opts.backoff.saturating_mul(1u32 << attempt.min(16));
                    tracing::debug!(
                        store = %self.inner.name(),
                        op,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient remote failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_permission_denied() {
                        tracing::warn!(store = %self.inner.name(), op, error = %e, "remote denied access");
                    }
                    return Err(e);
                }
                ok => return ok,
            }
        }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for RemoteStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_all_lists(&self) -> StoreResult<Vec<ListRecord>> {
        self.call("get_all_lists", || self.inner.get_all_lists()).await
    }

    async fn get_list(&self, id: &str) -> StoreResult<Option<ListRecord>> {
        self.call("get_list", || self.inner.get_list(id)).await
    }

    async fn save_list(&self, list: &ListRecord) -> StoreResult<()> {
        self.call("save_list", || self.inner.save_list(list)).await
    }

    async fn update_list(&self, list: &ListRecord) -> StoreResult<()> {
        self.call("update_list", || self.inner.update_list(list)).await
    }

    async fn delete_list(&self, id: &str) -> StoreResult<()> {
        self.call("delete_list", || self.inner.delete_list(id)).await
    }

    async fn get_all_items(&self) -> StoreResult<Vec<ItemRecord>> {
        self.call("get_all_items", || self.inner.get_all_items()).await
    }

    async fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<ItemRecord>> {
        self.call("get_items_by_list", || self.inner.get_items_by_list(list_id))
            .await
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<ItemRecord>> {
        self.call("get_item", || self.inner.get_item(id)).await
    }

    async fn save_item(&self, item: &ItemRecord) -> StoreResult<()> {
        self.call("save_item", || self.inner.save_item(item)).await
    }

    async fn update_item(&self, item: &ItemRecord) -> StoreResult<()> {
        self.call("update_item", || self.inner.update_item(item)).await
    }

    async fn delete_item(&self, id: &str) -> StoreResult<()> {
        self.call("delete_item", || self.inner.delete_item(id)).await
    }

    async fn is_available(&self) -> bool {
        tokio::time::timeout(self.opts.timeout, self.inner.is_available())
            .await
            .unwrap_or(false)
    }

    async fn last_modified(&self) -> StoreResult<Option<DateTime<Utc>>> {
        self.call("last_modified", || self.inner.last_modified()).await
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        self.call("get_meta", || self.inner.get_meta(key)).await
    }

    async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.call("set_meta", || self.inner.set_meta(key, value)).await
    }

    async fn remove_meta(&self, key: &str) -> StoreResult<()> {
        self.call("remove_meta", || self.inner.remove_meta(key)).await
    }

    async fn exists(&self, kind: RecordKind, id: &str) -> StoreResult<bool> {
        self.call("exists", || self.inner.exists(kind, id)).await
    }

    async fn upsert_list(&self, list: &ListRecord) -> StoreResult<bool> {
        self.call("upsert_list", || self.inner.upsert_list(list)).await
    }

    async fn upsert_item(&self, item: &ItemRecord) -> StoreResult<bool> {
        self.call("upsert_item", || self.inner.upsert_item(item)).await
    }
}
