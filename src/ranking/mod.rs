//! Ranking orchestration.
//!
//! [`Ranker`] wires candidate selection, the oracle, repair and persistence
//! together. The store and the oracle are injected; with no oracle every
//! incremental ranking resolves to the sentinel rank without a network call.

pub mod batch;
pub mod persist;
pub mod progress;
pub mod repair;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{select_for_comparison, select_for_full_rerank, CatalogStore, Item, StoreError};
use crate::category::Category;
use crate::oracle::{BulkRankingRequest, ComparativeRankingRequest, OracleError, RankingOracle};
use crate::prompts::MAX_REFERENCE_ITEMS;

pub use batch::{run_chunked, BatchConfig};
pub use persist::{persist_ranks, PersistOutcome};
pub use progress::{progress_channel, Phase, ProgressEvent, ProgressReporter, ProgressStream};
pub use repair::{repair_rankings, RepairError, RepairReport};

/// Rank given to items that could not be ranked by the oracle.
pub const SENTINEL_RANK: u32 = 999;

#[derive(Debug, thiserror::Error)]
pub enum RankError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("item not found: {0}")]
    ItemNotFound(String),
}

#[derive(Debug, Clone)]
pub struct RankerOptions {
    pub sentinel_rank: u32,
    /// References shown to the comparative prompt, at most
    /// [`MAX_REFERENCE_ITEMS`].
    pub comparison_limit: usize,
    pub batch: BatchConfig,
    /// Concurrent rank updates during persistence.
    pub persist_concurrency: usize,
}

impl Default for RankerOptions {
    fn default() -> Self {
        Self {
            sentinel_rank: SENTINEL_RANK,
            comparison_limit: MAX_REFERENCE_ITEMS,
            batch: BatchConfig::default(),
            persist_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RerankOutcome {
    pub category: Category,
    pub success: bool,
    pub ranked: usize,
    pub failed: usize,
    pub missing_repaired: usize,
    pub hallucinated_dropped: usize,
    /// Why the rerank wrote nothing, when it did not get that far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RerankOutcome {
    fn empty(category: Category) -> Self {
        Self {
            category,
            success: true,
            ranked: 0,
            failed: 0,
            missing_repaired: 0,
            hallucinated_dropped: 0,
            error: None,
        }
    }

    fn failure(category: Category, error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::empty(category)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FillOutcome {
    pub category: Category,
    /// Items that had no rank when the fill started.
    pub attempted: usize,
    /// Oracle-assigned ranks written.
    pub ranked: usize,
    /// Sentinel ranks written.
    pub fallback: usize,
    /// Transport failures (left unranked) plus failed writes.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryScore {
    pub category: Category,
    pub rank: u32,
    pub persisted: bool,
}

pub struct Ranker {
    store: Arc<dyn CatalogStore>,
    oracle: Option<Arc<dyn RankingOracle>>,
    options: RankerOptions,
    progress: ProgressReporter,
}

impl Ranker {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        oracle: Option<Arc<dyn RankingOracle>>,
        mut options: RankerOptions,
    ) -> Self {
        options.comparison_limit = options.comparison_limit.min(MAX_REFERENCE_ITEMS);
        if oracle.is_none() {
            warn!(
                error = %OracleError::Unavailable,
                sentinel = options.sentinel_rank,
                "ranking oracle not configured; incremental ranks fall back to the sentinel"
            );
        }
        Self {
            store,
            oracle,
            options,
            progress: ProgressReporter::disabled(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &RankerOptions {
        &self.options
    }

    fn emit(&self, category: Category, phase: Phase, processed: usize, total: usize) {
        self.progress.emit(category, phase, processed, total);
    }

    // =========================================================================
    // Bulk rerank
    // =========================================================================

    /// Rank every item in the catalog for `category` in one oracle call.
    ///
    /// On any oracle or validation failure nothing is written and the
    /// existing ranks stay as they were.
    pub async fn rerank_category(&self, category: Category) -> Result<RerankOutcome, RankError> {
        self.emit(category, Phase::SelectingCandidates, 0, 0);
        let items = match select_for_full_rerank(self.store.as_ref(), category).await {
            Ok(items) => items,
            Err(err) => {
                self.emit(category, Phase::Failed, 0, 0);
                return Err(err.into());
            }
        };
        let total = items.len();

        if total == 0 {
            info!(category = %category, "catalog is empty; nothing to rerank");
            self.emit(category, Phase::Completed, 0, 0);
            return Ok(RerankOutcome::empty(category));
        }

        let Some(oracle) = self.oracle.as_ref() else {
            warn!(category = %category, "bulk rerank skipped: oracle unavailable");
            self.emit(category, Phase::Failed, 0, total);
            return Ok(RerankOutcome::failure(category, OracleError::Unavailable));
        };

        self.emit(category, Phase::Prompting, 0, total);
        let candidates: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let request = BulkRankingRequest { category, items };

        self.emit(category, Phase::AwaitingOracle, 0, total);
        let returned = match oracle.rank_bulk(&request).await {
            Ok(returned) => returned,
            Err(err) => {
                warn!(category = %category, error = %err, "bulk rerank failed; ranks unchanged");
                self.emit(category, Phase::Failed, 0, total);
                return Ok(RerankOutcome::failure(category, err));
            }
        };

        self.emit(category, Phase::Validating, 0, total);
        let report = match repair_rankings(&candidates, &returned) {
            Ok(report) => report,
            Err(err) => {
                warn!(category = %category, error = %err, "bulk rerank rejected; ranks unchanged");
                self.emit(category, Phase::Failed, 0, total);
                return Ok(RerankOutcome::failure(category, err));
            }
        };
        log_repairs(category, &report);

        self.emit(category, Phase::Persisting, 0, total);
        let persisted = persist_ranks(
            self.store.as_ref(),
            category,
            &report.pairs,
            self.options.persist_concurrency,
        )
        .await;
        let success = persisted.failed == 0;
        self.emit(
            category,
            if success { Phase::Completed } else { Phase::Failed },
            persisted.succeeded + persisted.failed,
            total,
        );

        info!(
            category = %category,
            ranked = persisted.succeeded,
            failed = persisted.failed,
            "bulk rerank finished"
        );
        Ok(RerankOutcome {
            category,
            success,
            ranked: persisted.succeeded,
            failed: persisted.failed,
            missing_repaired: report.missing.len(),
            hallucinated_dropped: report.hallucinated.len(),
            error: None,
        })
    }

    /// Bulk rerank of every registered category, one after another.
    ///
    /// A store error in one category is reported in its outcome and does not
    /// stop the categories after it.
    pub async fn rerank_all(&self) -> Vec<RerankOutcome> {
        let mut outcomes = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let outcome = match self.rerank_category(category).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(category = %category, error = %err, "bulk rerank aborted");
                    RerankOutcome::failure(category, err)
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// First dense ranking for a newly introduced category.
    pub async fn initialize_category(&self, category: Category) -> Result<RerankOutcome, RankError> {
        info!(
            category = %category,
            column = %category.rank_column(),
            "initializing category ranking"
        );
        self.rerank_category(category).await
    }

    // =========================================================================
    // Incremental ranking
    // =========================================================================

    /// Rank one item against already-ranked references. Never fails: any
    /// problem resolves to the sentinel rank.
    pub async fn rank_new_item(&self, item: &Item, category: Category) -> u32 {
        let sentinel = self.options.sentinel_rank;
        let Some(oracle) = self.oracle.as_ref() else {
            return sentinel;
        };

        let references = match select_for_comparison(
            self.store.as_ref(),
            category,
            &item.id,
            self.options.comparison_limit,
        )
        .await
        {
            Ok(references) => references,
            Err(err) => {
                warn!(category = %category, course_id = %item.id, error = %err, "reference selection failed; using sentinel");
                return sentinel;
            }
        };

        let request = ComparativeRankingRequest {
            category,
            new_item: item.clone(),
            references,
        };
        match oracle.rank_comparative(&request).await {
            Ok(rank) => rank,
            Err(err) => {
                warn!(category = %category, course_id = %item.id, error = %err, "comparative ranking failed; using sentinel");
                sentinel
            }
        }
    }

    /// Rank a freshly inserted item in every category and persist each rank.
    pub async fn score_new_item(&self, item_id: &str) -> Result<Vec<CategoryScore>, RankError> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| RankError::ItemNotFound(item_id.to_string()))?;

        let mut scores = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let rank = self.rank_new_item(&item, category).await;
            let persisted = match self
                .store
                .update_rank(&item.id, category.rank_column(), rank)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(category = %category, course_id = %item.id, error = %err, "rank update failed");
                    false
                }
            };
            scores.push(CategoryScore {
                category,
                rank,
                persisted,
            });
        }
        Ok(scores)
    }

    /// Rank every item with no rank in `category`, comparatively and in chunks.
    ///
    /// Malformed answers resolve to the sentinel rank. Transport failures that
    /// survive the chunk retries leave the item unranked for a later run.
    pub async fn fill_missing_ranks(&self, category: Category) -> Result<FillOutcome, RankError> {
        self.emit(category, Phase::SelectingCandidates, 0, 0);
        let column = category.rank_column();
        let unranked = match self.store.select_unranked(column).await {
            Ok(items) => items,
            Err(err) => {
                self.emit(category, Phase::Failed, 0, 0);
                return Err(err.into());
            }
        };
        let total = unranked.len();
        let mut outcome = FillOutcome {
            category,
            attempted: total,
            ranked: 0,
            fallback: 0,
            failed: 0,
        };
        if total == 0 {
            self.emit(category, Phase::Completed, 0, 0);
            return Ok(outcome);
        }

        let sentinel = self.options.sentinel_rank;
        let results: Vec<Result<u32, OracleError>> = match self.oracle.as_ref() {
            None => unranked.iter().map(|_| Err(OracleError::Unavailable)).collect(),
            Some(oracle) => {
                let references = match self
                    .store
                    .select_ranked(column, None, Some(self.options.comparison_limit))
                    .await
                {
                    Ok(references) => references,
                    Err(err) => {
                        self.emit(category, Phase::Failed, 0, total);
                        return Err(err.into());
                    }
                };

                self.emit(category, Phase::AwaitingOracle, 0, total);
                run_chunked(
                    &unranked,
                    &self.options.batch,
                    |settled| self.emit(category, Phase::AwaitingOracle, settled, total),
                    |item| {
                        let request = ComparativeRankingRequest {
                            category,
                            new_item: item.clone(),
                            references: references.clone(),
                        };
                        let oracle = Arc::clone(oracle);
                        async move { oracle.rank_comparative(&request).await }
                    },
                )
                .await
            }
        };

        self.emit(category, Phase::Persisting, 0, total);
        let mut processed = 0;
        for (item, result) in unranked.iter().zip(results) {
            let (rank, is_fallback) = match result {
                Ok(rank) => (rank, false),
                Err(err @ OracleError::Transport(_)) => {
                    warn!(category = %category, course_id = %item.id, error = %err, "comparative ranking failed; leaving unranked");
                    outcome.failed += 1;
                    processed += 1;
                    continue;
                }
                Err(OracleError::Unavailable) => (sentinel, true),
                Err(err) => {
                    warn!(category = %category, course_id = %item.id, error = %err, "comparative ranking malformed; using sentinel");
                    (sentinel, true)
                }
            };

            match self.store.update_rank(&item.id, column, rank).await {
                Ok(()) if is_fallback => outcome.fallback += 1,
                Ok(()) => outcome.ranked += 1,
                Err(err) => {
                    warn!(category = %category, course_id = %item.id, rank, error = %err, "rank update failed");
                    outcome.failed += 1;
                }
            }
            processed += 1;
            self.emit(category, Phase::Persisting, processed, total);
        }

        let phase = if outcome.failed == 0 {
            Phase::Completed
        } else {
            Phase::Failed
        };
        self.emit(category, phase, processed, total);
        info!(
            category = %category,
            attempted = outcome.attempted,
            ranked = outcome.ranked,
            fallback = outcome.fallback,
            failed = outcome.failed,
            "fill-missing finished"
        );
        Ok(outcome)
    }
}

fn log_repairs(category: Category, report: &RepairReport) {
    if !report.missing.is_empty() {
        warn!(
            category = %category,
            missing = report.missing.len(),
            ids = ?report.missing,
            "oracle skipped candidates; appended after ranked items"
        );
    }
    if !report.hallucinated.is_empty() {
        warn!(
            category = %category,
            dropped = report.hallucinated.len(),
            ids = ?report.hallucinated,
            "oracle returned unknown ids; dropped"
        );
    }
    if !report.duplicates.is_empty() {
        warn!(
            category = %category,
            duplicates = report.duplicates.len(),
            ids = ?report.duplicates,
            "oracle repeated ids; kept first occurrence"
        );
    }
}
