//! Persistence interface for telemetry records

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::record::{CallRecord, ProviderUsage, StoredCallRecord, TokenTotals};

/// Storage collaborator for call telemetry.
///
/// The metrics layer only ever inserts through this trait; queries exist for
/// reporting and retention.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Persist one record and return its generated id
    async fn insert(&self, record: CallRecord) -> Result<String>;

    /// Persist several records. Stores that support transactions write them atomically.
    async fn insert_batch(&self, records: Vec<CallRecord>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.insert(record).await?);
        }
        Ok(ids)
    }

    async fn by_request_id(&self, request_id: &str) -> Result<Vec<StoredCallRecord>>;

    async fn by_provider(&self, provider_id: &str) -> Result<Vec<StoredCallRecord>>;

    async fn by_paired_group(&self, paired_group_id: &str) -> Result<Vec<StoredCallRecord>>;

    async fn by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredCallRecord>>;

    /// Mean latency over all records (or one provider's). Zero when empty.
    async fn average_latency(&self, provider_id: Option<&str>) -> Result<f64>;

    async fn total_tokens(&self, provider_id: Option<&str>) -> Result<TokenTotals>;

    async fn usage_by_provider(&self) -> Result<Vec<ProviderUsage>>;

    /// Delete records older than `age`, returning how many were removed
    async fn delete_older_than(&self, age: Duration) -> Result<usize>;
}
