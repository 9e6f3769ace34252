//! Usage tracking for oracle calls.
//!
//! The gateway reports every call, success or failure, to a [`UsageSink`].
//! The CLI uses [`TracingUsageSink`]; tests use [`NoopUsageSink`] or
//! [`MemoryUsageSink`] to count calls.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// One provider call, as seen by the gateway.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub model: String,
    pub caller: &'static str,
    pub run_id: Option<Uuid>,
    /// 1-based attempt number within the gateway retry loop.
    pub attempt: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        model: impl Into<String>,
        caller: &'static str,
        attempt: u32,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            caller,
            run_id: None,
            attempt,
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn cost(mut self, nanodollars: i64) -> Self {
        self.cost_nanodollars = nanodollars;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>, request_id: Option<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self.request_id = request_id;
        self
    }
}

/// Where usage records go. Must not fail the call it describes.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one structured `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            target: "catalog_ranker::usage",
            provider = record.provider,
            model = %record.model,
            caller = record.caller,
            run_id = ?record.run_id,
            attempt = record.attempt,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_nanos = record.cost_nanodollars,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            "oracle call"
        );
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProviderCallRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn total_cost_nanodollars(&self) -> i64 {
        self.records().iter().map(|r| r.cost_nanodollars).sum()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_collects_records() {
        let sink = MemoryUsageSink::new();
        sink.record(
            ProviderCallRecord::new("openrouter", "m", "test", 1)
                .tokens(3, 4)
                .cost(10),
        )
        .await;
        sink.record(
            ProviderCallRecord::new("openrouter", "m", "test", 2).error("timeout", None),
        )
        .await;

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, CallStatus::Error);
        assert_eq!(records[1].attempt, 2);
        assert_eq!(sink.total_cost_nanodollars(), 10);
    }
}
