//! SQLite telemetry store

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, Row, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::record::{CallMode, CallRecord, ProviderUsage, StoredCallRecord, TokenTotals};
use crate::store::MetricsStore;

const SELECT_COLUMNS: &str = "SELECT id, request_id, provider_id, provider_type, model, latency_ms,
        input_tokens, output_tokens, total_tokens, bytes_in, bytes_out, mode,
        paired_group_id, campaign_id, session_id, user_id, error_kind, created_at
     FROM call_metrics";

/// SQLite-backed [`MetricsStore`] (thread-safe via Arc<Mutex>)
pub struct SqliteMetricsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetricsStore {
    /// Open (or create) the database and initialize the schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Initializing telemetry database at {:?}", path.as_ref());
        Self::init(conn)
    }

    /// In-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS call_metrics (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                provider_type TEXT,
                model TEXT,
                latency_ms INTEGER NOT NULL,
                input_tokens INTEGER,
                output_tokens INTEGER,
                total_tokens INTEGER,
                bytes_in INTEGER,
                bytes_out INTEGER,
                mode TEXT NOT NULL DEFAULT 'single',
                paired_group_id TEXT,
                campaign_id TEXT,
                session_id TEXT,
                user_id TEXT,
                error_kind TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_call_metrics_request ON call_metrics(request_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_call_metrics_provider ON call_metrics(provider_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_call_metrics_created ON call_metrics(created_at)",
            [],
        )?;

        debug!("Telemetry schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
        conn.lock().unwrap_or_else(|poisoned| {
            warn!("Database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn insert_row(conn: &Connection, record: &CallRecord) -> rusqlite::Result<String> {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO call_metrics (
                id, request_id, provider_id, provider_type, model, latency_ms,
                input_tokens, output_tokens, total_tokens, bytes_in, bytes_out, mode,
                paired_group_id, campaign_id, session_id, user_id, error_kind, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                &id,
                &record.request_id,
                &record.provider_id,
                &record.provider_type,
                &record.model,
                to_sql_int(record.latency_ms),
                record.input_tokens.map(to_sql_int),
                record.output_tokens.map(to_sql_int),
                record.total_tokens.map(to_sql_int),
                record.bytes_in.map(to_sql_int),
                record.bytes_out.map(to_sql_int),
                record.mode.as_str(),
                &record.paired_group_id,
                &record.campaign_id,
                &record.session_id,
                &record.user_id,
                &record.error_kind,
                timestamp(&record.created_at),
            ],
        )?;
        Ok(id)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<StoredCallRecord> {
        let created_at: String = row.get(17)?;
        let mode: String = row.get(11)?;
        Ok(StoredCallRecord {
            id: row.get(0)?,
            record: CallRecord {
                request_id: row.get(1)?,
                provider_id: row.get(2)?,
                provider_type: row.get(3)?,
                model: row.get(4)?,
                latency_ms: from_sql_int(row.get(5)?),
                input_tokens: row.get::<_, Option<i64>>(6)?.map(from_sql_int),
                output_tokens: row.get::<_, Option<i64>>(7)?.map(from_sql_int),
                total_tokens: row.get::<_, Option<i64>>(8)?.map(from_sql_int),
                bytes_in: row.get::<_, Option<i64>>(9)?.map(from_sql_int),
                bytes_out: row.get::<_, Option<i64>>(10)?.map(from_sql_int),
                mode: CallMode::from_str(&mode),
                paired_group_id: row.get(12)?,
                campaign_id: row.get(13)?,
                session_id: row.get(14)?,
                user_id: row.get(15)?,
                error_kind: row.get(16)?,
                created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
            },
        })
    }

    /// Run a filtered SELECT with a single text parameter
    async fn query_where(&self, clause: &'static str, value: String) -> Result<Vec<StoredCallRecord>> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let sql = format!("{} WHERE {} ORDER BY created_at ASC", SELECT_COLUMNS, clause);
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![value], Self::row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn insert(&self, record: CallRecord) -> Result<String> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let id = Self::insert_row(&conn, &record)?;
            debug!("Inserted call metrics: {} via {} ({})", record.request_id, record.provider_id, id);
            Ok(id)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn insert_batch(&self, records: Vec<CallRecord>) -> Result<Vec<String>> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = Self::lock(&conn);
            let tx = conn.transaction()?;
            let ids = records
                .iter()
                .map(|record| Self::insert_row(&tx, record))
                .collect::<Result<Vec<_>, _>>()?;
            tx.commit()?;
            debug!("Inserted batch of {} call metrics", ids.len());
            Ok(ids)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn by_request_id(&self, request_id: &str) -> Result<Vec<StoredCallRecord>> {
        self.query_where("request_id = ?1", request_id.to_owned()).await
    }

    async fn by_provider(&self, provider_id: &str) -> Result<Vec<StoredCallRecord>> {
        self.query_where("provider_id = ?1", provider_id.to_owned()).await
    }

    async fn by_paired_group(&self, paired_group_id: &str) -> Result<Vec<StoredCallRecord>> {
        self.query_where("paired_group_id = ?1", paired_group_id.to_owned()).await
    }

    async fn by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredCallRecord>> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let sql = format!(
                "{} WHERE created_at >= ?1 AND created_at <= ?2 ORDER BY created_at ASC",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![timestamp(&start), timestamp(&end)], Self::row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn average_latency(&self, provider_id: Option<&str>) -> Result<f64> {
        let conn = Arc::clone(&self.conn);
        let provider_id = provider_id.map(|s| s.to_owned());

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let avg: Option<f64> = conn.query_row(
                "SELECT AVG(latency_ms) FROM call_metrics WHERE ?1 IS NULL OR provider_id = ?1",
                params![provider_id],
                |row| row.get(0),
            )?;
            Ok(avg.unwrap_or(0.0))
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn total_tokens(&self, provider_id: Option<&str>) -> Result<TokenTotals> {
        let conn = Arc::clone(&self.conn);
        let provider_id = provider_id.map(|s| s.to_owned());

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let (input, output): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0)
                 FROM call_metrics WHERE ?1 IS NULL OR provider_id = ?1",
                params![provider_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(TokenTotals {
                input: from_sql_int(input),
                output: from_sql_int(output),
            })
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn usage_by_provider(&self) -> Result<Vec<ProviderUsage>> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let mut stmt = conn.prepare(
                "SELECT provider_id,
                        COUNT(*),
                        SUM(CASE WHEN error_kind IS NULL THEN 0 ELSE 1 END),
                        AVG(latency_ms),
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0)
                 FROM call_metrics
                 GROUP BY provider_id
                 ORDER BY provider_id",
            )?;
            let usage = stmt
                .query_map([], |row| {
                    Ok(ProviderUsage {
                        provider_id: row.get(0)?,
                        calls: from_sql_int(row.get(1)?),
                        errors: from_sql_int(row.get(2)?),
                        avg_latency_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        input_tokens: from_sql_int(row.get(4)?),
                        output_tokens: from_sql_int(row.get(5)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(usage)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn delete_older_than(&self, age: Duration) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            debug!("Prune age {} reaches past the calendar, nothing to delete", age);
            return Ok(0);
        };
        let cutoff = timestamp(&cutoff);

        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&conn);
            let deleted = conn.execute(
                "DELETE FROM call_metrics WHERE created_at < ?1",
                params![cutoff],
            )?;
            if deleted > 0 {
                info!("Pruned {} call metrics older than {}", deleted, cutoff);
            }
            Ok(deleted)
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

/// Fixed-width UTC timestamps so text comparison matches time order
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, provider_id: &str, latency_ms: u64) -> CallRecord {
        let mut record = CallRecord::new(request_id, provider_id, latency_ms);
        record.input_tokens = Some(25);
        record.output_tokens = Some(12);
        record
    }

    #[tokio::test]
    async fn test_insert_and_query_by_request() -> Result<()> {
        let store = SqliteMetricsStore::in_memory()?;
        let mut rec = record("req_123", "openai", 150);
        rec.model = Some("gpt-3.5-turbo".to_string());
        rec.bytes_in = Some(1024);
        rec.bytes_out = Some(512);
        rec.campaign_id = Some("campaign_1".to_string());
        rec.session_id = Some("session_1".to_string());
        rec.user_id = Some("user_1".to_string());

        let id = store.insert(rec.clone()).await?;
        assert!(!id.is_empty());

        let rows = store.by_request_id("req_123").await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].record.model.as_deref(), Some("gpt-3.5-turbo"));
        assert_eq!(rows[0].record.bytes_in, Some(1024));
        assert_eq!(rows[0].record.mode, CallMode::Single);
        assert_eq!(rows[0].record.user_id.as_deref(), Some("user_1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_optional_fields_stay_empty() -> Result<()> {
        let store = SqliteMetricsStore::in_memory()?;
        store.insert(CallRecord::new("req_124", "ollama", 200)).await?;

        let rows = store.by_request_id("req_124").await?;
        let rec = &rows[0].record;
        assert_eq!(rec.input_tokens, None);
        assert_eq!(rec.bytes_out, None);
        assert_eq!(rec.session_id, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_aggregates_per_provider() -> Result<()> {
        let store = SqliteMetricsStore::in_memory()?;
        store
            .insert_batch(vec![
                record("r1", "openai", 100),
                record("r2", "openai", 200),
                record("r3", "ollama", 50),
            ])
            .await?;

        assert_eq!(store.average_latency(Some("openai")).await?, 150.0);
        assert_eq!(store.average_latency(Some("missing")).await?, 0.0);
        assert_eq!(
            store.total_tokens(None).await?,
            TokenTotals { input: 75, output: 36 }
        );

        let usage = store.usage_by_provider().await?;
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].provider_id, "ollama");
        assert_eq!(usage[1].calls, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_paired_group_and_errors() -> Result<()> {
        let store = SqliteMetricsStore::in_memory()?;
        for provider in ["openai", "ollama"] {
            let mut rec = record("req_pair", provider, 120);
            rec.mode = CallMode::PairedEval;
            rec.paired_group_id = Some("group_1".to_string());
            store.insert(rec).await?;
        }
        let mut failed = record("req_err", "openai", 10);
        failed.error_kind = Some("rate_limit".to_string());
        store.insert(failed).await?;

        let group = store.by_paired_group("group_1").await?;
        assert_eq!(group.len(), 2);
        assert!(group.iter().all(|r| r.record.mode == CallMode::PairedEval));

        let usage = store.usage_by_provider().await?;
        let openai = usage.iter().find(|u| u.provider_id == "openai").unwrap();
        assert_eq!(openai.errors, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_time_range_and_prune() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SqliteMetricsStore::new(dir.path().join("telemetry.db"))?;

        let mut old = record("old", "openai", 10);
        old.created_at = Utc::now() - Duration::days(40);
        store.insert(old).await?;
        store.insert(record("new", "openai", 10)).await?;

        let recent = store
            .by_time_range(Utc::now() - Duration::days(1), Utc::now() + Duration::minutes(1))
            .await?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record.request_id, "new");

        assert_eq!(store.delete_older_than(Duration::days(30)).await?, 1);
        assert_eq!(store.by_provider("openai").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_with_huge_age_deletes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = SqliteMetricsStore::new(dir.path().join("telemetry.db"))?;

        let mut old = record("old", "openai", 10);
        old.created_at = Utc::now() - Duration::days(3650);
        store.insert(old).await?;

        let age = Duration::try_days(1_000_000_000).unwrap();
        assert_eq!(store.delete_older_than(age).await?, 0);
        assert_eq!(store.by_request_id("old").await?.len(), 1);
        Ok(())
    }
}
