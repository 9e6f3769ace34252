//! Catalog storage contract and candidate selection.
//!
//! The ranker never owns items or scores. It reads items and writes one rank
//! per (item, category) through [`CatalogStore`], which lets the relational
//! store be swapped for [`MemoryCatalogStore`] in tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::category::{Category, RankColumn};

pub use memory::MemoryCatalogStore;
pub use sqlite::{CategoryLock, SqliteCatalogStore};

/// A course as the ranker sees it. Owned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_tag: Option<String>,
}

impl Item {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            key_skills: Vec::new(),
            provider: None,
            primary_tag: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_key_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_primary_tag(mut self, tag: impl Into<String>) -> Self {
        self.primary_tag = Some(tag.into());
        self
    }
}

/// An item together with its current rank in one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedItem {
    pub item: Item,
    pub rank: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("injected failure: {0}")]
    Injected(String),
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Every item, in stable catalog order.
    async fn select_all(&self) -> Result<Vec<Item>, StoreError>;

    /// Items with a non-null rank in `column`, ascending by rank.
    async fn select_ranked(
        &self,
        column: &RankColumn,
        exclude_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RankedItem>, StoreError>;

    /// Items whose rank in `column` is null.
    async fn select_unranked(&self, column: &RankColumn) -> Result<Vec<Item>, StoreError>;

    async fn get_item(&self, id: &str) -> Result<Option<Item>, StoreError>;

    /// Single-row, single-column update. Unknown ids are `NotFound`.
    async fn update_rank(
        &self,
        item_id: &str,
        column: &RankColumn,
        rank: u32,
    ) -> Result<(), StoreError>;
}

/// Every item in the catalog. No category filtering: ranking is comparative
/// across the whole corpus.
pub async fn select_for_full_rerank(
    store: &dyn CatalogStore,
    category: Category,
) -> Result<Vec<Item>, StoreError> {
    let items = store.select_all().await?;
    tracing::debug!(category = %category, count = items.len(), "selected full-rerank candidates");
    Ok(items)
}

/// Up to `limit` already-ranked items (best first), never including `exclude_id`.
pub async fn select_for_comparison(
    store: &dyn CatalogStore,
    category: Category,
    exclude_id: &str,
    limit: usize,
) -> Result<Vec<RankedItem>, StoreError> {
    store
        .select_ranked(category.rank_column(), Some(exclude_id), Some(limit))
        .await
}
