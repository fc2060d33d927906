//! Metrics sink contract and the values passed through it

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_config::ProviderType;
use switchyard_telemetry::{CallMode, CallRecord};
use uuid::Uuid;

use crate::context::CallContext;
use crate::normalize::ClassifiedError;

/// Identity of one provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsContext {
    pub request_id: String,
    pub provider_id: String,
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub mode: CallMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_group_id: Option<String>,
}

impl MetricsContext {
    /// Context for a call; the request id comes from `call` or is generated
    pub fn new(provider_type: ProviderType, provider_id: impl Into<String>, call: &CallContext) -> Self {
        Self {
            request_id: call
                .request_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            provider_id: provider_id.into(),
            provider_type,
            model: None,
            campaign_id: call.campaign_id.clone(),
            session_id: call.session_id.clone(),
            user_id: None,
            mode: CallMode::Single,
            paired_group_id: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn paired(mut self, group_id: impl Into<String>) -> Self {
        self.mode = CallMode::PairedEval;
        self.paired_group_id = Some(group_id.into());
        self
    }

    /// Telemetry record for this call with the given measurements
    pub fn to_record(&self, metrics: &CallMetrics) -> CallRecord {
        let mut record = CallRecord::new(
            self.request_id.clone(),
            self.provider_id.clone(),
            metrics.latency_ms.unwrap_or(0),
        );
        record.provider_type = Some(self.provider_type.to_string());
        record.model = metrics.model.clone().or_else(|| self.model.clone());
        record.input_tokens = metrics.input_tokens;
        record.output_tokens = metrics.output_tokens;
        record.total_tokens = metrics.total_tokens;
        record.bytes_in = metrics.bytes_in;
        record.bytes_out = metrics.bytes_out;
        record.mode = self.mode;
        record.paired_group_id = self.paired_group_id.clone();
        record.campaign_id = self.campaign_id.clone();
        record.session_id = self.session_id.clone();
        record.user_id = self.user_id.clone();
        record
    }
}

/// Measurements for a call; every field is optional so partial values can be merged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
}

impl CallMetrics {
    pub fn tokens(input: u64, output: u64) -> Self {
        Self {
            input_tokens: Some(input),
            output_tokens: Some(output),
            ..Self::default()
        }
    }

    /// Add counters from a stream chunk
    pub fn accumulate(&mut self, chunk: &CallMetrics) {
        fn add(total: &mut Option<u64>, value: Option<u64>) {
            if let Some(value) = value {
                *total = Some(total.unwrap_or(0).saturating_add(value));
            }
        }
        add(&mut self.input_tokens, chunk.input_tokens);
        add(&mut self.output_tokens, chunk.output_tokens);
        add(&mut self.total_tokens, chunk.total_tokens);
        add(&mut self.bytes_in, chunk.bytes_in);
        add(&mut self.bytes_out, chunk.bytes_out);
        if chunk.model.is_some() {
            self.model = chunk.model.clone();
        }
    }

    /// Values in `other` replace ours where present
    pub fn overlay(mut self, other: &CallMetrics) -> Self {
        fn pick<T: Clone>(ours: &mut Option<T>, theirs: &Option<T>) {
            if theirs.is_some() {
                *ours = theirs.clone();
            }
        }
        pick(&mut self.latency_ms, &other.latency_ms);
        pick(&mut self.model, &other.model);
        pick(&mut self.input_tokens, &other.input_tokens);
        pick(&mut self.output_tokens, &other.output_tokens);
        pick(&mut self.total_tokens, &other.total_tokens);
        pick(&mut self.bytes_in, &other.bytes_in);
        pick(&mut self.bytes_out, &other.bytes_out);
        self
    }

    /// Fill `total_tokens` from input and output when it was not given
    pub fn fill_total(&mut self) {
        if self.total_tokens.is_none() {
            if let (Some(input), Some(output)) = (self.input_tokens, self.output_tokens) {
                self.total_tokens = Some(input.saturating_add(output));
            }
        }
    }
}

/// Receiver of per-call lifecycle notifications.
///
/// Sinks must never fail the call that produced the metrics: persistence
/// errors are handled inside the sink.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    fn on_request_start(&self, _ctx: &MetricsContext) {}

    async fn on_request_end(&self, ctx: &MetricsContext, metrics: &CallMetrics);

    async fn on_request_error(&self, ctx: &MetricsContext, error: &ClassifiedError, latency_ms: u64);

    /// Opt in to per-chunk notifications
    fn wants_stream_chunks(&self) -> bool {
        false
    }

    async fn on_stream_chunk(&self, _ctx: &MetricsContext, _chunk: &CallMetrics) {}

    async fn on_stream_end(&self, _ctx: &MetricsContext, _metrics: &CallMetrics) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_overlay() {
        let mut acc = CallMetrics::default();
        acc.accumulate(&CallMetrics {
            output_tokens: Some(3),
            bytes_out: Some(10),
            ..CallMetrics::default()
        });
        acc.accumulate(&CallMetrics {
            output_tokens: Some(4),
            bytes_out: Some(12),
            ..CallMetrics::default()
        });
        assert_eq!(acc.output_tokens, Some(7));
        assert_eq!(acc.bytes_out, Some(22));
        assert_eq!(acc.input_tokens, None);

        let merged = acc.overlay(&CallMetrics {
            input_tokens: Some(20),
            output_tokens: Some(8),
            ..CallMetrics::default()
        });
        assert_eq!(merged.input_tokens, Some(20));
        assert_eq!(merged.output_tokens, Some(8));
        assert_eq!(merged.bytes_out, Some(22));
    }

    #[test]
    fn test_fill_total() {
        let mut metrics = CallMetrics::tokens(10, 5);
        metrics.fill_total();
        assert_eq!(metrics.total_tokens, Some(15));

        let mut explicit = CallMetrics {
            total_tokens: Some(99),
            ..CallMetrics::tokens(10, 5)
        };
        explicit.fill_total();
        assert_eq!(explicit.total_tokens, Some(99));

        let mut partial = CallMetrics {
            input_tokens: Some(10),
            ..CallMetrics::default()
        };
        partial.fill_total();
        assert_eq!(partial.total_tokens, None);
    }

    #[test]
    fn test_record_from_context() {
        let call = CallContext::campaign("c1").with_request_id("req_9");
        let ctx = MetricsContext::new(ProviderType::Llm, "openai", &call)
            .with_model("gpt-4o")
            .paired("group_1");
        let record = ctx.to_record(&CallMetrics {
            latency_ms: Some(120),
            ..CallMetrics::tokens(5, 6)
        });
        assert_eq!(record.request_id, "req_9");
        assert_eq!(record.provider_type.as_deref(), Some("llm"));
        assert_eq!(record.model.as_deref(), Some("gpt-4o"));
        assert_eq!(record.latency_ms, 120);
        assert_eq!(record.mode, CallMode::PairedEval);
        assert_eq!(record.campaign_id.as_deref(), Some("c1"));
        assert!(!record.is_error());
    }
}
