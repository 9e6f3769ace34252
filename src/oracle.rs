//! Oracle client: turns ranking requests into chat calls and strictly parses
//! the answers.
//!
//! A response either parses into typed ranks or is a
//! [`OracleError::MalformedResponse`]; no partial use of a malformed payload.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{Item, RankedItem};
use crate::category::Category;
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError,
};
use crate::prompts::{
    bulk_ranking_prompt, comparative_ranking_prompt, comparative_upper_bound, shown_references,
};

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

const COMPARATIVE_MAX_OUTPUT_TOKENS: u32 = 64;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: no credential configured")]
    Unavailable,
    #[error("oracle transport error: {0}")]
    Transport(#[from] ProviderError),
    #[error("malformed oracle response: {0}")]
    MalformedResponse(String),
}

impl OracleError {
    /// Rate limits, 5xx and timeouts. Malformed answers are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Transport(err) => err.is_retryable(),
            OracleError::Unavailable | OracleError::MalformedResponse(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            OracleError::Transport(err) => err.retry_after(),
            _ => None,
        }
    }
}

/// One (id, rank) pair as returned by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedId {
    pub course_id: String,
    pub rank: u32,
}

impl RankedId {
    pub fn new(course_id: impl Into<String>, rank: u32) -> Self {
        Self {
            course_id: course_id.into(),
            rank,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkRankingRequest {
    pub category: Category,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub struct ComparativeRankingRequest {
    pub category: Category,
    pub new_item: Item,
    /// Already-ranked items, best first.
    pub references: Vec<RankedItem>,
}

impl ComparativeRankingRequest {
    /// Bound over the references the prompt shows, not the whole list.
    pub fn upper_bound(&self) -> u32 {
        comparative_upper_bound(shown_references(&self.references))
    }
}

#[async_trait]
pub trait RankingOracle: Send + Sync {
    async fn rank_bulk(&self, req: &BulkRankingRequest) -> Result<Vec<RankedId>, OracleError>;

    /// A rank within `1..=req.upper_bound()`.
    async fn rank_comparative(&self, req: &ComparativeRankingRequest)
        -> Result<u32, OracleError>;
}

// =============================================================================
// JSON parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct BulkResponseJson {
    rankings: Vec<RankingEntryJson>,
}

#[derive(Debug, Deserialize)]
struct RankingEntryJson {
    #[serde(rename = "courseId", alias = "course_id")]
    course_id: String,
    rank: Value,
}

#[derive(Debug, Deserialize)]
struct ComparativeResponseJson {
    rank: Value,
}

fn malformed(msg: impl Into<String>) -> OracleError {
    OracleError::MalformedResponse(msg.into())
}

/// Positive integer that fits a `u32`. Floats, strings and zero are rejected.
fn strict_rank(value: &Value) -> Result<u32, OracleError> {
    let n = value
        .as_u64()
        .ok_or_else(|| malformed(format!("rank is not a non-negative integer: {value}")))?;
    if n == 0 {
        return Err(malformed("rank must be positive"));
    }
    u32::try_from(n).map_err(|_| malformed(format!("rank out of range: {n}")))
}

/// Parse `{"rankings": [{"courseId": ..., "rank": ...}]}`.
pub fn parse_bulk_response(raw: &str) -> Result<Vec<RankedId>, OracleError> {
    let json_str = extract_json(raw).ok_or_else(|| malformed("no JSON object in response"))?;
    let parsed: BulkResponseJson =
        serde_json::from_str(json_str).map_err(|e| malformed(e.to_string()))?;

    parsed
        .rankings
        .into_iter()
        .map(|entry| {
            Ok(RankedId {
                rank: strict_rank(&entry.rank)?,
                course_id: entry.course_id,
            })
        })
        .collect()
}

/// Parse `{"rank": n}`; ranks above `upper_bound` are clamped to it.
pub fn parse_comparative_response(raw: &str, upper_bound: u32) -> Result<u32, OracleError> {
    let json_str = extract_json(raw).ok_or_else(|| malformed("no JSON object in response"))?;
    let parsed: ComparativeResponseJson =
        serde_json::from_str(json_str).map_err(|e| malformed(e.to_string()))?;
    let rank = strict_rank(&parsed.rank)?;
    if rank > upper_bound {
        debug!(rank, upper_bound, "clamping comparative rank");
    }
    Ok(rank.min(upper_bound.max(1)))
}

/// Extract the first balanced JSON object (models sometimes wrap it in prose).
///
/// Braces inside string literals are skipped.
fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// LLM oracle
// =============================================================================

/// [`RankingOracle`] backed by a chat gateway.
pub struct LlmOracle<G: ChatGateway> {
    gateway: Arc<G>,
    model: String,
    temperature: f32,
    run_id: Uuid,
}

impl<G: ChatGateway> LlmOracle<G> {
    pub fn new(gateway: Arc<G>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Stamped on every call this oracle makes; see [`Attribution`].
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn request(&self, messages: Vec<Message>, caller: &'static str) -> ChatRequest {
        let mut request = ChatRequest::new(
            ChatModel::openrouter(&self.model),
            messages,
            Attribution::new(caller).with_run(self.run_id),
        )
        .temperature(self.temperature);
        // Only OpenAI models reliably support response_format=json_object via OpenRouter.
        if self.model.starts_with("openai/") {
            request = request.json();
        }
        request
    }
}

#[async_trait]
impl<G: ChatGateway> RankingOracle for LlmOracle<G> {
    async fn rank_bulk(&self, req: &BulkRankingRequest) -> Result<Vec<RankedId>, OracleError> {
        let prompt = bulk_ranking_prompt(req.category, &req.items);
        let request = self.request(prompt.to_messages(), "oracle::bulk");
        let response = self.gateway.chat(request).await?;
        debug!(
            category = %req.category,
            items = req.items.len(),
            output_tokens = response.output_tokens,
            "bulk ranking response received"
        );
        parse_bulk_response(&response.content)
    }

    async fn rank_comparative(
        &self,
        req: &ComparativeRankingRequest,
    ) -> Result<u32, OracleError> {
        let prompt = comparative_ranking_prompt(req.category, &req.new_item, &req.references);
        let request = self
            .request(prompt.to_messages(), "oracle::comparative")
            .max_tokens(COMPARATIVE_MAX_OUTPUT_TOKENS);
        let response = self.gateway.chat(request).await?;
        parse_comparative_response(&response.content, req.upper_bound())
    }
}

// =============================================================================
// TESTS
// =============================================================================
