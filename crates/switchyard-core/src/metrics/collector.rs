//! Per-call metrics collector

use std::sync::Arc;
use std::time::Instant;

use super::sink::{CallMetrics, MetricsContext, MetricsSink};
use crate::normalize::ClassifiedError;

/// Wraps one provider call and reports its lifecycle to a sink
pub struct MetricsCollector {
    ctx: MetricsContext,
    sink: Arc<dyn MetricsSink>,
    started: Instant,
    streamed: CallMetrics,
}

impl MetricsCollector {
    pub fn new(ctx: MetricsContext, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            ctx,
            sink,
            started: Instant::now(),
            streamed: CallMetrics::default(),
        }
    }

    pub fn context(&self) -> &MetricsContext {
        &self.ctx
    }

    pub fn start(&mut self) {
        self.started = Instant::now();
        self.sink.on_request_start(&self.ctx);
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Finish a call. Latency is measured unless `partial` carries one.
    pub async fn end(&mut self, partial: CallMetrics) -> CallMetrics {
        let mut metrics = partial;
        if metrics.latency_ms.is_none() {
            metrics.latency_ms = Some(self.elapsed_ms());
        }
        metrics.fill_total();
        self.sink.on_request_end(&self.ctx, &metrics).await;
        metrics
    }

    pub async fn error(&mut self, error: &ClassifiedError) {
        let latency_ms = self.elapsed_ms();
        self.sink.on_request_error(&self.ctx, error, latency_ms).await;
    }

    /// Accumulate counters from one streamed chunk
    pub async fn stream_chunk(&mut self, chunk: CallMetrics) {
        self.streamed.accumulate(&chunk);
        if self.sink.wants_stream_chunks() {
            self.sink.on_stream_chunk(&self.ctx, &chunk).await;
        }
    }

    /// Finish a streamed call: accumulated counters merged with `finals`,
    /// reported through both the stream hook and the regular end hook
    pub async fn stream_end(&mut self, finals: CallMetrics) -> CallMetrics {
        let mut merged = std::mem::take(&mut self.streamed).overlay(&finals);
        if merged.latency_ms.is_none() {
            merged.latency_ms = Some(self.elapsed_ms());
        }
        merged.fill_total();
        self.sink.on_stream_end(&self.ctx, &merged).await;
        self.end(merged).await
    }
}
