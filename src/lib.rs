#![forbid(unsafe_code)]

//! # catalog-ranker
//!
//! Per-category relevance ranks for a course catalog, judged by an LLM.
//!
//! A bulk rerank asks the oracle to order every course for one audience
//! category at once; the answer is reconciled against the real candidate set
//! (unknown ids dropped, skipped ids appended last, ranks compacted to
//! `1..=N`) before any rank is written. Incremental ranking places a single
//! new course against the best already-ranked ones. Without an oracle
//! credential everything degrades to a fixed sentinel rank instead of failing.

pub mod catalog;
pub mod category;
pub mod config;
pub mod gateway;
pub mod oracle;
pub mod prompts;
pub mod ranking;

pub use catalog::{CatalogStore, Item, MemoryCatalogStore, RankedItem, SqliteCatalogStore, StoreError};
pub use category::{Category, CategoryError, CategoryRegistry, RankColumn};
pub use config::RankerConfig;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use oracle::{LlmOracle, OracleError, RankedId, RankingOracle};
pub use ranking::{
    progress_channel, CategoryScore, FillOutcome, Phase, ProgressEvent, RankError, Ranker,
    RankerOptions, RerankOutcome, SENTINEL_RANK,
};
