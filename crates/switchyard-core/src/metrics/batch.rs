//! Database-backed sink that batches call records

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use switchyard_telemetry::{CallRecord, MetricsStore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::sink::{CallMetrics, MetricsContext, MetricsSink};
use crate::normalize::ClassifiedError;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_pending: usize,
    pub log_errors: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            max_pending: 1000,
            log_errors: true,
        }
    }
}

#[derive(Default)]
struct Queue {
    records: VecDeque<CallRecord>,
    /// Set by shutdown; later records bypass the queue
    closed: bool,
}

enum Push {
    Queued { flush: bool },
    Closed(CallRecord),
}

struct BatchInner {
    store: Arc<dyn MetricsStore>,
    queue: Mutex<Queue>,
    /// Held across drain and write so shutdown waits out a flush in flight
    flushing: tokio::sync::Mutex<()>,
    options: BatchOptions,
}

impl BatchInner {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            warn!("Metrics batch lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn push(&self, record: CallRecord) -> Push {
        let mut queue = self.queue();
        if queue.closed {
            return Push::Closed(record);
        }
        queue.records.push_back(record);
        while queue.records.len() > self.options.max_pending.max(1) {
            if let Some(dropped) = queue.records.pop_front() {
                warn!(
                    "Metrics queue full ({}), dropping oldest record {}",
                    self.options.max_pending, dropped.request_id
                );
            }
        }
        Push::Queued {
            flush: queue.records.len() >= self.options.batch_size.max(1),
        }
    }

    fn close(&self) {
        self.queue().closed = true;
    }

    async fn flush(&self) {
        let _flushing = self.flushing.lock().await;
        let batch: Vec<CallRecord> = self.queue().records.drain(..).collect();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match self.store.insert_batch(batch).await {
            Ok(_) => debug!("Flushed {} call records", count),
            Err(e) => {
                if self.options.log_errors {
                    error!("Failed to persist {} call records: {:#}", count, e);
                }
            }
        }
    }

    async fn insert_now(&self, record: CallRecord) {
        let request_id = record.request_id.clone();
        if let Err(e) = self.store.insert(record).await {
            if self.options.log_errors {
                error!("Failed to persist call record {}: {:#}", request_id, e);
            }
        }
    }
}

/// Persists call records through a [`MetricsStore`].
///
/// Completed calls are queued and written in batches, on reaching
/// `batch_size` or on each `flush_interval` tick. Failed calls are written
/// immediately. Store failures are logged and swallowed.
///
/// Must be created inside a tokio runtime; call [`BatchingSink::shutdown`]
/// to stop the timer and drain the queue. Records reported after shutdown
/// are written one at a time.
pub struct BatchingSink {
    inner: Arc<BatchInner>,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingSink {
    pub fn new(store: Arc<dyn MetricsStore>, options: BatchOptions) -> Self {
        let inner = Arc::new(BatchInner {
            store,
            queue: Mutex::new(Queue::default()),
            flushing: tokio::sync::Mutex::new(()),
            options,
        });
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(flush_loop(Arc::clone(&inner), cancel.clone()));

        Self {
            inner,
            cancel,
            timer: Mutex::new(Some(timer)),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.queue().records.len()
    }

    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stop the flush timer and write everything still pending, including
    /// a batch already being written
    pub async fn shutdown(&self) {
        self.inner.close();
        self.cancel.cancel();
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!("Metrics flush timer ended abnormally: {}", e);
            }
        }
        self.inner.flush().await;
    }
}

impl Drop for BatchingSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn flush_loop(inner: Arc<BatchInner>, cancel: CancellationToken) {
    let period = inner.options.flush_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Metrics flush timer stopped");
                break;
            }
            _ = ticker.tick() => {
                inner.flush().await;
            }
        }
    }
}

#[async_trait]
impl MetricsSink for BatchingSink {
    async fn on_request_end(&self, ctx: &MetricsContext, metrics: &CallMetrics) {
        match self.inner.push(ctx.to_record(metrics)) {
            Push::Queued { flush: true } => self.inner.flush().await,
            Push::Queued { flush: false } => {}
            Push::Closed(record) => {
                debug!("Metrics sink closed, writing {} directly", record.request_id);
                self.inner.insert_now(record).await;
            }
        }
    }

    async fn on_request_error(&self, ctx: &MetricsContext, error: &ClassifiedError, latency_ms: u64) {
        let mut record = ctx.to_record(&CallMetrics {
            latency_ms: Some(latency_ms),
            ..CallMetrics::default()
        });
        record.error_kind = Some(error.kind.to_string());
        self.inner.insert_now(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::normalize::normalize;
    use switchyard_config::ProviderType;
    use switchyard_telemetry::MemoryMetricsStore;

    fn ctx(request_id: &str) -> MetricsContext {
        MetricsContext::new(
            ProviderType::Llm,
            "openai",
            &CallContext::new().with_request_id(request_id),
        )
    }

    fn options(batch_size: usize) -> BatchOptions {
        BatchOptions {
            batch_size,
            flush_interval: Duration::from_secs(3600),
            ..BatchOptions::default()
        }
    }

    #[tokio::test]
    async fn test_flushes_at_batch_size() {
        let store = Arc::new(MemoryMetricsStore::new());
        let sink = BatchingSink::new(store.clone(), options(2));

        sink.on_request_end(&ctx("a"), &CallMetrics::tokens(1, 1)).await;
        assert_eq!(store.len(), 0);
        assert_eq!(sink.pending_len(), 1);

        sink.on_request_end(&ctx("b"), &CallMetrics::tokens(1, 1)).await;
        assert_eq!(store.insert_calls(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(sink.pending_len(), 0);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending() {
        let store = Arc::new(MemoryMetricsStore::new());
        let sink = BatchingSink::new(store.clone(), options(10));

        for id in ["a", "b", "c"] {
            sink.on_request_end(&ctx(id), &CallMetrics::default()).await;
        }
        assert!(store.is_empty());

        sink.shutdown().await;
        assert_eq!(store.len(), 3);
        assert_eq!(sink.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timer_flushes_pending() {
        let store = Arc::new(MemoryMetricsStore::new());
        let sink = BatchingSink::new(
            store.clone(),
            BatchOptions {
                batch_size: 100,
                flush_interval: Duration::from_millis(20),
                ..BatchOptions::default()
            },
        );

        sink.on_request_end(&ctx("a"), &CallMetrics::default()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.len(), 1);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_written_immediately() {
        let store = Arc::new(MemoryMetricsStore::new());
        let sink = BatchingSink::new(store.clone(), options(10));

        let err = normalize(&anyhow::anyhow!("HTTP 503 from upstream"), Some("openai"), None);
        sink.on_request_error(&ctx("a"), &err, 42).await;

        let stored = store.snapshot();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record.error_kind.as_deref(), Some("unavailable"));
        assert_eq!(stored[0].record.latency_ms, 42);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failures_never_raise() {
        let store = Arc::new(MemoryMetricsStore::new());
        store.set_fail_inserts(true);
        let sink = BatchingSink::new(store.clone(), options(1));

        sink.on_request_end(&ctx("a"), &CallMetrics::default()).await;
        let err = normalize(&anyhow::anyhow!("boom"), None, None);
        sink.on_request_error(&ctx("b"), &err, 1).await;
        sink.shutdown().await;

        assert!(store.is_empty());
        assert_eq!(sink.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_oldest() {
        let store = Arc::new(MemoryMetricsStore::new());
        let sink = BatchingSink::new(
            store.clone(),
            BatchOptions {
                batch_size: 100,
                max_pending: 2,
                flush_interval: Duration::from_secs(3600),
                log_errors: true,
            },
        );

        for id in ["a", "b", "c"] {
            sink.on_request_end(&ctx(id), &CallMetrics::default()).await;
        }
        assert_eq!(sink.pending_len(), 2);

        sink.shutdown().await;
        let mut ids: Vec<_> = store
            .snapshot()
            .into_iter()
            .map(|s| s.record.request_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_flush_in_flight() {
        let store = Arc::new(MemoryMetricsStore::new());
        store.set_insert_delay(Duration::from_millis(300));
        let sink = Arc::new(BatchingSink::new(store.clone(), options(1)));

        let writer = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                sink.on_request_end(&ctx("a"), &CallMetrics::default()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.pending_len(), 0);

        sink.shutdown().await;
        assert_eq!(store.len(), 1);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_records_after_shutdown_are_written() {
        let store = Arc::new(MemoryMetricsStore::new());
        let sink = BatchingSink::new(store.clone(), options(10));
        sink.shutdown().await;

        sink.on_request_end(&ctx("late"), &CallMetrics::tokens(2, 3)).await;
        assert_eq!(sink.pending_len(), 0);
        let stored = store.snapshot();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record.request_id, "late");
        assert_eq!(stored[0].record.input_tokens, Some(2));
    }
}
