//! In-memory catalog for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CatalogStore, Item, RankedItem, StoreError};
use crate::category::{Category, RankColumn};

#[derive(Debug, Default)]
struct State {
    items: Vec<Item>,
    ranks: HashMap<(String, String), u32>,
    failing_ids: HashSet<String>,
}

/// Keeps insertion order as catalog order. Writes can be made to fail per id.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<State>,
    update_calls: AtomicUsize,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let store = Self::new();
        for item in items {
            store.insert(item);
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace by id.
    pub fn insert(&self, item: Item) {
        let mut state = self.lock();
        match state.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => state.items.push(item),
        }
    }

    pub fn set_rank(&self, item_id: &str, category: Category, rank: u32) {
        let column = category.rank_column().as_str().to_string();
        self.lock().ranks.insert((item_id.to_string(), column), rank);
    }

    pub fn rank(&self, item_id: &str, category: Category) -> Option<u32> {
        let column = category.rank_column().as_str().to_string();
        self.lock().ranks.get(&(item_id.to_string(), column)).copied()
    }

    /// Ranks for every item in `category`, in catalog order.
    pub fn ranks(&self, category: Category) -> Vec<(String, Option<u32>)> {
        let column = category.rank_column().as_str();
        let state = self.lock();
        state
            .items
            .iter()
            .map(|i| {
                let rank = state.ranks.get(&(i.id.clone(), column.to_string())).copied();
                (i.id.clone(), rank)
            })
            .collect()
    }

    /// Make every future `update_rank` for `item_id` fail.
    pub fn fail_updates_for(&self, item_id: &str) {
        self.lock().failing_ids.insert(item_id.to_string());
    }

    /// Number of `update_rank` calls attempted, successful or not.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn select_all(&self) -> Result<Vec<Item>, StoreError> {
        Ok(self.lock().items.clone())
    }

    async fn select_ranked(
        &self,
        column: &RankColumn,
        exclude_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RankedItem>, StoreError> {
        let state = self.lock();
        let mut ranked: Vec<RankedItem> = state
            .items
            .iter()
            .filter(|i| Some(i.id.as_str()) != exclude_id)
            .filter_map(|i| {
                state
                    .ranks
                    .get(&(i.id.clone(), column.as_str().to_string()))
                    .map(|&rank| RankedItem {
                        item: i.clone(),
                        rank,
                    })
            })
            .collect();
        ranked.sort_by_key(|r| r.rank);
        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        Ok(ranked)
    }

    async fn select_unranked(&self, column: &RankColumn) -> Result<Vec<Item>, StoreError> {
        let state = self.lock();
        Ok(state
            .items
            .iter()
            .filter(|i| {
                !state
                    .ranks
                    .contains_key(&(i.id.clone(), column.as_str().to_string()))
            })
            .cloned()
            .collect())
    }

    async fn get_item(&self, id: &str) -> Result<Option<Item>, StoreError> {
        Ok(self.lock().items.iter().find(|i| i.id == id).cloned())
    }

    async fn update_rank(
        &self,
        item_id: &str,
        column: &RankColumn,
        rank: u32,
    ) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.failing_ids.contains(item_id) {
            return Err(StoreError::Injected(format!("update for {item_id}")));
        }
        if !state.items.iter().any(|i| i.id == item_id) {
            return Err(StoreError::NotFound(format!("course {item_id}")));
        }
        state
            .ranks
            .insert((item_id.to_string(), column.as_str().to_string()), rank);
        Ok(())
    }
}
