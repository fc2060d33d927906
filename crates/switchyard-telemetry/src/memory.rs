//! In-memory telemetry store

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::record::{CallRecord, ProviderUsage, StoredCallRecord, TokenTotals};
use crate::store::MetricsStore;

/// Vec-backed [`MetricsStore`]. Inserts can be made to fail on demand.
#[derive(Default)]
pub struct MemoryMetricsStore {
    records: Mutex<Vec<StoredCallRecord>>,
    fail_inserts: AtomicBool,
    insert_calls: AtomicUsize,
    insert_delay_ms: AtomicU64,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail (or succeed again)
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Hold every subsequent insert for `delay` before it lands
    pub fn set_insert_delay(&self, delay: std::time::Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.insert_delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn delay(&self) {
        let millis = self.insert_delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        }
    }

    /// Number of insert or insert_batch calls, including failed ones
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<StoredCallRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn filtered(&self, keep: impl Fn(&CallRecord) -> bool) -> Vec<StoredCallRecord> {
        let mut rows: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|row| keep(&row.record))
            .collect();
        rows.sort_by_key(|row| row.record.created_at);
        rows
    }

    fn push_all(&self, records: Vec<CallRecord>) -> Result<Vec<String>> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            bail!("insert rejected by store");
        }
        let mut guard = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ids = records
            .into_iter()
            .map(|record| {
                let id = Uuid::new_v4().to_string();
                guard.push(StoredCallRecord {
                    id: id.clone(),
                    record,
                });
                id
            })
            .collect();
        Ok(ids)
    }
}

fn matches_provider(record: &CallRecord, provider_id: Option<&str>) -> bool {
    provider_id.is_none_or(|id| record.provider_id == id)
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn insert(&self, record: CallRecord) -> Result<String> {
        self.delay().await;
        let mut ids = self.push_all(vec![record])?;
        Ok(ids.remove(0))
    }

    async fn insert_batch(&self, records: Vec<CallRecord>) -> Result<Vec<String>> {
        self.delay().await;
        self.push_all(records)
    }

    async fn by_request_id(&self, request_id: &str) -> Result<Vec<StoredCallRecord>> {
        Ok(self.filtered(|r| r.request_id == request_id))
    }

    async fn by_provider(&self, provider_id: &str) -> Result<Vec<StoredCallRecord>> {
        Ok(self.filtered(|r| r.provider_id == provider_id))
    }

    async fn by_paired_group(&self, paired_group_id: &str) -> Result<Vec<StoredCallRecord>> {
        Ok(self.filtered(|r| r.paired_group_id.as_deref() == Some(paired_group_id)))
    }

    async fn by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredCallRecord>> {
        Ok(self.filtered(|r| r.created_at >= start && r.created_at <= end))
    }

    async fn average_latency(&self, provider_id: Option<&str>) -> Result<f64> {
        let rows = self.filtered(|r| matches_provider(r, provider_id));
        if rows.is_empty() {
            return Ok(0.0);
        }
        let sum: u64 = rows.iter().map(|r| r.record.latency_ms).sum();
        Ok(sum as f64 / rows.len() as f64)
    }

    async fn total_tokens(&self, provider_id: Option<&str>) -> Result<TokenTotals> {
        let totals = self
            .filtered(|r| matches_provider(r, provider_id))
            .iter()
            .fold(TokenTotals::default(), |acc, row| TokenTotals {
                input: acc.input + row.record.input_tokens.unwrap_or(0),
                output: acc.output + row.record.output_tokens.unwrap_or(0),
            });
        Ok(totals)
    }

    async fn usage_by_provider(&self) -> Result<Vec<ProviderUsage>> {
        let mut usage: Vec<ProviderUsage> = Vec::new();
        let mut latency_sums: Vec<u64> = Vec::new();
        for row in self.snapshot() {
            let r = &row.record;
            let idx = match usage.iter().position(|u| u.provider_id == r.provider_id) {
                Some(idx) => idx,
                None => {
                    usage.push(ProviderUsage {
                        provider_id: r.provider_id.clone(),
                        calls: 0,
                        errors: 0,
                        avg_latency_ms: 0.0,
                        input_tokens: 0,
                        output_tokens: 0,
                    });
                    latency_sums.push(0);
                    usage.len() - 1
                }
            };
            let entry = &mut usage[idx];
            entry.calls += 1;
            entry.errors += u64::from(r.is_error());
            entry.input_tokens += r.input_tokens.unwrap_or(0);
            entry.output_tokens += r.output_tokens.unwrap_or(0);
            latency_sums[idx] += r.latency_ms;
        }
        for (entry, sum) in usage.iter_mut().zip(latency_sums) {
            entry.avg_latency_ms = sum as f64 / entry.calls as f64;
        }
        usage.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(usage)
    }

    async fn delete_older_than(&self, age: Duration) -> Result<usize> {
        // nothing predates a cutoff beyond the representable range
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };
        let mut guard = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = guard.len();
        guard.retain(|row| row.record.created_at >= cutoff);
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_aggregate() {
        let store = MemoryMetricsStore::new();
        let mut a = CallRecord::new("r1", "openai", 100);
        a.input_tokens = Some(10);
        let mut b = CallRecord::new("r2", "openai", 300);
        b.error_kind = Some("timeout".to_string());
        store.insert_batch(vec![a, b]).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.average_latency(Some("openai")).await.unwrap(), 200.0);
        assert_eq!(store.total_tokens(None).await.unwrap().input, 10);

        let usage = store.usage_by_provider().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].errors, 1);
        assert_eq!(usage[0].avg_latency_ms, 200.0);
    }

    #[tokio::test]
    async fn test_failing_inserts() {
        let store = MemoryMetricsStore::new();
        store.set_fail_inserts(true);
        assert!(store.insert(CallRecord::new("r1", "openai", 1)).await.is_err());
        assert_eq!(store.insert_calls(), 1);
        assert!(store.is_empty());

        store.set_fail_inserts(false);
        store.insert(CallRecord::new("r1", "openai", 1)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_prune() {
        let store = MemoryMetricsStore::new();
        let mut old = CallRecord::new("old", "openai", 1);
        old.created_at = Utc::now() - Duration::hours(5);
        store.insert(old).await.unwrap();
        store.insert(CallRecord::new("new", "openai", 1)).await.unwrap();

        assert_eq!(store.delete_older_than(Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(store.by_request_id("new").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_with_huge_age_keeps_everything() {
        let store = MemoryMetricsStore::new();
        let mut old = CallRecord::new("old", "openai", 1);
        old.created_at = Utc::now() - Duration::days(3650);
        store.insert(old).await.unwrap();

        let age = Duration::try_days(1_000_000_000).unwrap();
        assert_eq!(store.delete_older_than(age).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_delay() {
        let store = MemoryMetricsStore::new();
        store.set_insert_delay(std::time::Duration::from_millis(50));
        let started = std::time::Instant::now();
        store.insert(CallRecord::new("r1", "openai", 1)).await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
        assert_eq!(store.len(), 1);
    }
}
