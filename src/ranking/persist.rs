//! Writes accepted ranks back to the catalog, one update per item.
//!
//! Updates are independent: a failed write is counted and the rest still run.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::warn;

use crate::catalog::CatalogStore;
use crate::category::Category;
use crate::oracle::RankedId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl PersistOutcome {
    pub fn merge(&mut self, other: PersistOutcome) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

pub async fn persist_ranks(
    store: &dyn CatalogStore,
    category: Category,
    pairs: &[RankedId],
    concurrency: usize,
) -> PersistOutcome {
    let column = category.rank_column();

    let results = stream::iter(pairs.iter().map(|pair| async move {
        let result = store.update_rank(&pair.course_id, column, pair.rank).await;
        (pair, result)
    }))
    .buffer_unordered(concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut outcome = PersistOutcome::default();
    for (pair, result) in results {
        match result {
            Ok(()) => outcome.succeeded += 1,
            Err(err) => {
                warn!(
                    category = %category,
                    course_id = %pair.course_id,
                    rank = pair.rank,
                    error = %err,
                    "rank update failed"
                );
                outcome.failed += 1;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Item, MemoryCatalogStore};

    #[tokio::test]
    async fn one_failed_write_does_not_abort_siblings() {
        let store = MemoryCatalogStore::with_items([
            Item::new("a", "A"),
            Item::new("b", "B"),
            Item::new("c", "C"),
        ]);
        store.fail_updates_for("b");
        let pairs = vec![
            RankedId::new("a", 1),
            RankedId::new("b", 2),
            RankedId::new("c", 3),
        ];

        let outcome = persist_ranks(&store, Category::Healthcare, &pairs, 2).await;
        assert_eq!(
            outcome,
            PersistOutcome {
                succeeded: 2,
                failed: 1
            }
        );
        assert_eq!(store.update_calls(), 3);
        assert_eq!(store.rank("a", Category::Healthcare), Some(1));
        assert_eq!(store.rank("c", Category::Healthcare), Some(3));
        assert_eq!(store.rank("b", Category::Healthcare), None);
    }
}
