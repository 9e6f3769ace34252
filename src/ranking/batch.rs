//! Chunked fan-out of oracle calls with retry on rate-limit/5xx signals.
//!
//! Inputs are processed in fixed-size chunks; every call in a chunk runs
//! concurrently. Calls that fail with a retryable error are retried (only
//! those) after a jittered exponential backoff, up to `max_chunk_retries`
//! times. An optional fixed pause separates chunks.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::gateway::backoff_delay;
use crate::oracle::OracleError;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub chunk_size: usize,
    /// Fixed pacing between chunks; zero disables it.
    pub chunk_pause: Duration,
    pub max_chunk_retries: u32,
    pub retry_base_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            chunk_pause: Duration::ZERO,
            max_chunk_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Run `call` for every input; results come back in input order.
///
/// `on_chunk` is told how many inputs have been settled after each chunk.
pub async fn run_chunked<I, T, F, Fut>(
    inputs: &[I],
    config: &BatchConfig,
    mut on_chunk: impl FnMut(usize),
    call: F,
) -> Vec<Result<T, OracleError>>
where
    F: Fn(&I) -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let chunk_size = config.chunk_size.max(1);
    let chunk_count = inputs.len().div_ceil(chunk_size);
    let mut results = Vec::with_capacity(inputs.len());

    for (chunk_idx, chunk) in inputs.chunks(chunk_size).enumerate() {
        let mut slots: Vec<Option<Result<T, OracleError>>> = chunk.iter().map(|_| None).collect();
        let mut pending: Vec<usize> = (0..chunk.len()).collect();
        let mut attempt: u32 = 0;

        loop {
            let outcomes = join_all(pending.iter().map(|&i| call(&chunk[i]))).await;
            for (&i, outcome) in pending.iter().zip(outcomes) {
                slots[i] = Some(outcome);
            }

            let retryable: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| matches!(&slots[i], Some(Err(e)) if e.is_retryable()))
                .collect();
            if retryable.is_empty() || attempt >= config.max_chunk_retries {
                if !retryable.is_empty() {
                    warn!(
                        chunk = chunk_idx,
                        failed = retryable.len(),
                        "giving up on retryable failures in chunk"
                    );
                }
                break;
            }

            let hint = retryable
                .iter()
                .filter_map(|&i| match &slots[i] {
                    Some(Err(e)) => e.retry_after(),
                    _ => None,
                })
                .max();
            let delay = backoff_delay(
                config.retry_base_delay,
                config.max_retry_delay,
                attempt,
                hint,
            );
            warn!(
                chunk = chunk_idx,
                retrying = retryable.len(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying rate-limited or failed calls in chunk"
            );
            sleep(delay).await;
            attempt += 1;
            pending = retryable;
        }

        // Every slot is filled by the first pass.
        results.extend(slots.into_iter().flatten());
        on_chunk(results.len());
        debug!(chunk = chunk_idx, settled = results.len(), "chunk settled");

        if chunk_idx + 1 < chunk_count && !config.chunk_pause.is_zero() {
            sleep(config.chunk_pause).await;
        }
    }

    results
}
