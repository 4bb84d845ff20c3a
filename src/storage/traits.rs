//! Store contract consumed by the coordinator and its engines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::types::{ItemRecord, ListRecord, Record, RecordKind, Versioned};

/// CRUD backend for lists and items.
///
/// Both the on-device store and the remote backend implement this trait.
/// `save_*` inserts and reports `AlreadyExists` for a taken identifier;
/// `update_*` replaces and reports `NotFound` for an unknown one;
/// `delete_*` removes the row physically (tombstoning is the coordinator's job).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &str;

    async fn get_all_lists(&self) -> StoreResult<Vec<ListRecord>>;
    async fn get_list(&self, id: &str) -> StoreResult<Option<ListRecord>>;
    async fn save_list(&self, list: &ListRecord) -> StoreResult<()>;
    async fn update_list(&self, list: &ListRecord) -> StoreResult<()>;
    async fn delete_list(&self, id: &str) -> StoreResult<()>;

    async fn get_all_items(&self) -> StoreResult<Vec<ItemRecord>>;
    async fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<ItemRecord>>;
    async fn get_item(&self, id: &str) -> StoreResult<Option<ItemRecord>>;
    async fn save_item(&self, item: &ItemRecord) -> StoreResult<()>;
    async fn update_item(&self, item: &ItemRecord) -> StoreResult<()>;
    async fn delete_item(&self, id: &str) -> StoreResult<()>;

    /// Cheap health probe.
    async fn is_available(&self) -> bool;

    /// Time of the most recent mutation, if any.
    async fn last_modified(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn get_meta(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn remove_meta(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, kind: RecordKind, id: &str) -> StoreResult<bool> {
        Ok(match kind {
            RecordKind::List => self.get_list(id).await?.is_some(),
            RecordKind::Item => self.get_item(id).await?.is_some(),
        })
    }

    /// Insert or replace. Returns `true` when an existing record was replaced.
    ///
    /// Stores with a native upsert primitive should override this.
    async fn upsert_list(&self, list: &ListRecord) -> StoreResult<bool> {
        if self.exists(RecordKind::List, &list.id).await? {
            self.update_list(list).await?;
            return Ok(true);
        }
        match self.save_list(list).await {
            Ok(()) => Ok(false),
            // Lost a race with another writer; the row is there now.
            Err(StoreError::AlreadyExists { .. }) => self.update_list(list).await.map(|()| true),
            Err(e) => Err(e),
        }
    }

    async fn upsert_item(&self, item: &ItemRecord) -> StoreResult<bool> {
        if self.exists(RecordKind::Item, &item.id).await? {
            self.update_item(item).await?;
            return Ok(true);
        }
        match self.save_item(item).await {
            Ok(()) => Ok(false),
            Err(StoreError::AlreadyExists { .. }) => self.update_item(item).await.map(|()| true),
            Err(e) => Err(e),
        }
    }
}

/// Lets kind-generic code write a record into any store.
#[async_trait]
pub trait Upsert: Versioned + Send + Sync {
    async fn upsert_into(&self, store: &dyn RecordStore) -> StoreResult<bool>;
}

#[async_trait]
impl Upsert for ListRecord {
    async fn upsert_into(&self, store: &dyn RecordStore) -> StoreResult<bool> {
        store.upsert_list(self).await
    }
}

#[async_trait]
impl Upsert for ItemRecord {
    async fn upsert_into(&self, store: &dyn RecordStore) -> StoreResult<bool> {
        store.upsert_item(self).await
    }
}

/// Upsert either record kind.
pub async fn upsert_record(store: &dyn RecordStore, record: &Record) -> StoreResult<bool> {
    match record {
        Record::List(list) => store.upsert_list(list).await,
        Record::Item(item) => store.upsert_item(item).await,
    }
}

/// Full snapshot of a store, tombstones included.
pub async fn load_all(store: &dyn RecordStore) -> StoreResult<(Vec<ListRecord>, Vec<ItemRecord>)> {
    let lists = store.get_all_lists().await?;
    let items = store.get_all_items().await?;
    Ok((lists, items))
}
