//! Oracle transport: OpenRouter chat completions with retry and usage records.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use openrouter::ChatProvider;
use usage::ProviderCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use pricing::chat_cost;
pub use types::*;
pub use usage::{MemoryUsageSink, NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Retries after the first attempt; only retryable errors are retried.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on any single wait, including server-suggested ones.
    pub max_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    provider: Arc<dyn ChatProvider>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn with_config(
        provider: impl ChatProvider + 'static,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            usage_sink,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt: u32 = 0;

        loop {
            let result = self.provider.chat(&req).await;
            let record = ProviderCallRecord::new(
                req.model.provider(),
                req.model.model_id(),
                req.attribution.caller,
                attempt + 1,
            )
            .run(req.attribution.run_id);

            match result {
                Ok(resp) => {
                    let record = record
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .cost(resp.cost_nanodollars)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = record.error(err.code(), err.request_id().map(str::to_string));
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(
                        self.config.retry_base_delay,
                        self.config.max_delay,
                        attempt,
                        err.retry_after(),
                    );
                    warn!(
                        caller = req.attribution.caller,
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "oracle call failed; retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff with ±25% jitter.
///
/// `attempt` is zero-based. A server-suggested wait raises the floor; the
/// result never exceeds `max`.
pub fn backoff_delay(
    base: Duration,
    max: Duration,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.min(10));
    let exp = base.saturating_mul(multiplier);
    let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    let jittered = exp.mul_f64(jitter);
    let delay = match retry_after {
        Some(hint) => jittered.max(hint),
        None => jittered,
    };
    let delay = delay.min(max);
    debug!(attempt, delay_ms = delay.as_millis() as u64, "computed backoff");
    delay
}
