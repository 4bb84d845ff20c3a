//! MemoryStore — a `RecordStore` that keeps everything in process memory.
//!
//! Used as the default on-device store when no embedded database is wanted,
//! and as a stand-in for the remote backend in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::types::{ItemRecord, ListRecord, RecordKind, Snapshot};

use super::traits::RecordStore;

#[derive(Default)]
struct State {
    /// id → list, ordered for deterministic scans
    lists: BTreeMap<String, ListRecord>,
    /// id → item
    items: BTreeMap<String, ItemRecord>,
    meta: HashMap<String, String>,
    last_modified: Option<DateTime<Utc>>,
}

impl State {
    fn touch(&mut self) {
        let now = Utc::now();
        self.last_modified = Some(self.last_modified.map_or(now, |prev| prev.max(now)));
    }
}

/// In-memory store. Interior mutability via `parking_lot::Mutex`.
pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Flip the health probe result.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every stored record, tombstones included, ordered by id.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            lists: state.lists.values().cloned().collect(),
            items: state.items.values().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.lists.len() + state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all_lists(&self) -> StoreResult<Vec<ListRecord>> {
        Ok(self.state.lock().lists.values().cloned().collect())
    }

    async fn get_list(&self, id: &str) -> StoreResult<Option<ListRecord>> {
        Ok(self.state.lock().lists.get(id).cloned())
    }

    async fn save_list(&self, list: &ListRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.lists.contains_key(&list.id) {
            return Err(StoreError::AlreadyExists {
                kind: RecordKind::List,
                id: list.id.clone(),
            });
        }
        state.lists.insert(list.id.clone(), list.clone());
        state.touch();
        Ok(())
    }

    async fn update_list(&self, list: &ListRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.lists.get_mut(&list.id) {
            Some(slot) => *slot = list.clone(),
            None => {
                return Err(StoreError::NotFound {
                    kind: RecordKind::List,
                    id: list.id.clone(),
                })
            }
        }
        state.touch();
        Ok(())
    }

    async fn delete_list(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.lists.remove(id).is_some() {
            state.touch();
        }
        Ok(())
    }

    async fn get_all_items(&self) -> StoreResult<Vec<ItemRecord>> {
        Ok(self.state.lock().items.values().cloned().collect())
    }

    async fn get_items_by_list(&self, list_id: &str) -> StoreResult<Vec<ItemRecord>> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .filter(|i| i.list_id == list_id)
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<ItemRecord>> {
        Ok(self.state.lock().items.get(id).cloned())
    }

    async fn save_item(&self, item: &ItemRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.items.contains_key(&item.id) {
            return Err(StoreError::AlreadyExists {
                kind: RecordKind::Item,
                id: item.id.clone(),
            });
        }
        state.items.insert(item.id.clone(), item.clone());
        state.touch();
        Ok(())
    }

    async fn update_item(&self, item: &ItemRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.items.get_mut(&item.id) {
            Some(slot) => {
                if slot.list_id != item.list_id {
                    return Err(StoreError::Invalid(format!(
                        "item {} cannot move from list {} to {}",
                        item.id, slot.list_id, item.list_id
                    )));
                }
                *slot = item.clone();
            }
            None => {
                return Err(StoreError::NotFound {
                    kind: RecordKind::Item,
                    id: item.id.clone(),
                })
            }
        }
        state.touch();
        Ok(())
    }

    async fn delete_item(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.items.remove(id).is_some() {
            state.touch();
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn last_modified(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().last_modified)
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.lock().meta.get(key).cloned())
    }

    async fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        self.state
            .lock()
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_meta(&self, key: &str) -> StoreResult<()> {
        self.state.lock().meta.remove(key);
        Ok(())
    }

    // Single lock for check-and-write.
    async fn upsert_list(&self, list: &ListRecord) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let replaced = state.lists.insert(list.id.clone(), list.clone()).is_some();
        state.touch();
        Ok(replaced)
    }

    async fn upsert_item(&self, item: &ItemRecord) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if let Some(existing) = state.items.get(&item.id) {
            if existing.list_id != item.list_id {
                return Err(StoreError::Invalid(format!(
                    "item {} cannot move from list {} to {}",
                    item.id, existing.list_id, item.list_id
                )));
            }
        }
        let replaced = state.items.insert(item.id.clone(), item.clone()).is_some();
        state.touch();
        Ok(replaced)
    }
}
