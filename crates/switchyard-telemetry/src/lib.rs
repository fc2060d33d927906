//! switchyard-telemetry - persisted per-call metrics
//!
//! Record types, the [`MetricsStore`] contract, and SQLite and in-memory stores.

pub mod memory;
pub mod record;
pub mod sqlite;
pub mod store;

pub use memory::MemoryMetricsStore;
pub use record::{CallMode, CallRecord, ProviderUsage, StoredCallRecord, TokenTotals};
pub use sqlite::SqliteMetricsStore;
pub use store::MetricsStore;
