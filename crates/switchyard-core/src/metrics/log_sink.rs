//! Sink that writes call metrics to the tracing log

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::sink::{CallMetrics, MetricsContext, MetricsSink};
use crate::normalize::{ClassifiedError, redact};

/// Logs every call as one redacted JSON line
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

/// Context and `extra` are redacted; token counters are attached afterwards
fn payload(ctx: &MetricsContext, metrics: Option<&CallMetrics>, extra: Value) -> Value {
    let mut value = serde_json::to_value(ctx).unwrap_or(Value::Null);
    if let (Value::Object(map), Value::Object(extra)) = (&mut value, extra) {
        map.extend(extra);
    }
    let mut value = redact(&value);
    if let (Value::Object(map), Some(metrics)) = (&mut value, metrics) {
        map.insert(
            "metrics".to_string(),
            serde_json::to_value(metrics).unwrap_or(Value::Null),
        );
    }
    value
}

#[async_trait]
impl MetricsSink for TracingSink {
    fn on_request_start(&self, ctx: &MetricsContext) {
        debug!(
            "Provider call {} started on {}:{}",
            ctx.request_id, ctx.provider_type, ctx.provider_id
        );
    }

    async fn on_request_end(&self, ctx: &MetricsContext, metrics: &CallMetrics) {
        let line = payload(ctx, Some(metrics), json!({}));
        info!("Provider call completed: {}", line);
    }

    async fn on_request_error(&self, ctx: &MetricsContext, error: &ClassifiedError, latency_ms: u64) {
        let line = payload(ctx, None, json!({ "error": error, "latency_ms": latency_ms }));
        warn!("Provider call failed: {}", line);
    }
}
