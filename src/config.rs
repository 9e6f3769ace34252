//! Environment-driven configuration.
//!
//! A missing oracle credential is not an error: the ranker runs with no
//! oracle and falls back to the sentinel rank.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::SqliteCatalogStore;
use crate::gateway::openrouter::{OpenRouterAdapter, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::gateway::{GatewayConfig, ProviderError, ProviderGateway, UsageSink};
use crate::oracle::{LlmOracle, RankingOracle, DEFAULT_MODEL};
use crate::ranking::{BatchConfig, RankerOptions};

#[derive(Debug, Clone)]
pub struct RankerConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub app_title: Option<String>,
    pub model: String,
    pub db_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_pause: Duration,
    /// Chunk-level retries of calls that failed with a retryable error.
    pub max_retries: u32,
    /// Gateway retries inside a single oracle call. Zero leaves retrying to
    /// the chunk controller; a fill-missing item then sees at most
    /// `(1 + call_retries) * (1 + max_retries)` HTTP attempts.
    pub call_retries: u32,
    /// Base of the jittered exponential backoff for both retry layers.
    pub retry_base_delay: Duration,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            app_title: None,
            model: DEFAULT_MODEL.to_string(),
            db_path: PathBuf::from(".catalog_ranker.sqlite"),
            chunk_size: 10,
            chunk_pause: Duration::ZERO,
            max_retries: 2,
            call_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl RankerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENROUTER_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            base_url: std::env::var("OPENROUTER_BASE_URL").unwrap_or(defaults.base_url),
            timeout: env_parse("OPENROUTER_TIMEOUT_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            app_title: std::env::var("OPENROUTER_APP_TITLE").ok(),
            model: std::env::var("RANKER_MODEL").unwrap_or(defaults.model),
            db_path: SqliteCatalogStore::default_path(),
            chunk_size: env_parse::<usize>("RANKER_CHUNK_SIZE")
                .filter(|&n| n > 0)
                .unwrap_or(defaults.chunk_size),
            chunk_pause: env_parse("RANKER_CHUNK_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_pause),
            max_retries: env_parse("RANKER_MAX_RETRIES").unwrap_or(defaults.max_retries),
            call_retries: env_parse("RANKER_CALL_RETRIES").unwrap_or(defaults.call_retries),
            retry_base_delay: env_parse("RANKER_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.call_retries,
            retry_base_delay: self.retry_base_delay,
            ..GatewayConfig::default()
        }
    }

    pub fn ranker_options(&self) -> RankerOptions {
        RankerOptions {
            batch: BatchConfig {
                chunk_size: self.chunk_size,
                chunk_pause: self.chunk_pause,
                max_chunk_retries: self.max_retries,
                retry_base_delay: self.retry_base_delay,
                ..BatchConfig::default()
            },
            ..RankerOptions::default()
        }
    }

    /// The OpenRouter-backed oracle, or `None` when no credential is set.
    pub fn build_oracle<U: UsageSink + 'static>(
        &self,
        usage_sink: Arc<U>,
    ) -> Result<Option<Arc<dyn RankingOracle>>, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(None);
        };
        let adapter = OpenRouterAdapter::with_config(
            api_key,
            self.base_url.clone(),
            self.timeout,
            self.app_title.clone(),
        )?;
        let gateway = ProviderGateway::with_config(adapter, usage_sink, self.gateway_config());
        let oracle: Arc<dyn RankingOracle> =
            Arc::new(LlmOracle::new(Arc::new(gateway), self.model.clone()));
        Ok(Some(oracle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NoopUsageSink;

    #[test]
    fn no_credential_means_no_oracle() {
        let config = RankerConfig::default();
        let oracle = config.build_oracle(Arc::new(NoopUsageSink)).unwrap();
        assert!(oracle.is_none());
    }

    #[test]
    fn retry_layers_have_separate_knobs() {
        let config = RankerConfig {
            max_retries: 3,
            call_retries: 1,
            retry_base_delay: Duration::from_millis(5),
            ..RankerConfig::default()
        };
        assert_eq!(config.gateway_config().max_retries, 1);
        assert_eq!(config.ranker_options().batch.max_chunk_retries, 3);
        assert_eq!(
            config.ranker_options().batch.retry_base_delay,
            Duration::from_millis(5)
        );
        assert_eq!(
            config.gateway_config().retry_base_delay,
            Duration::from_millis(5)
        );
    }

    #[test]
    fn credential_builds_oracle_and_options_follow_config() {
        let config = RankerConfig {
            api_key: Some("sk-test".into()),
            chunk_size: 4,
            max_retries: 5,
            ..RankerConfig::default()
        };
        assert!(config.build_oracle(Arc::new(NoopUsageSink)).unwrap().is_some());
        let options = config.ranker_options();
        assert_eq!(options.batch.chunk_size, 4);
        assert_eq!(options.batch.max_chunk_retries, 5);
        assert_eq!(config.gateway_config().max_retries, 0);
    }
}
