//! Per-adapter success/error counters

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AdapterKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub errors: u64,
    /// Constructions, not cache hits
    pub successes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Counters for registered keys only; updates to unknown keys are ignored
#[derive(Default)]
pub(crate) struct StatsTable {
    entries: Mutex<HashMap<AdapterKey, ProviderStats>>,
}

impl StatsTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<AdapterKey, ProviderStats>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Stats mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn ensure(&self, key: &AdapterKey) {
        self.lock().entry(key.clone()).or_default();
    }

    pub fn remove(&self, key: &AdapterKey) {
        self.lock().remove(key);
    }

    pub fn record_success(&self, key: &AdapterKey) {
        if let Some(stats) = self.lock().get_mut(key) {
            stats.successes += 1;
            stats.last_used = Some(Utc::now());
        }
    }

    pub fn record_error(&self, key: &AdapterKey) {
        if let Some(stats) = self.lock().get_mut(key) {
            stats.errors += 1;
        }
    }

    pub fn touch(&self, key: &AdapterKey) {
        if let Some(stats) = self.lock().get_mut(key) {
            stats.last_used = Some(Utc::now());
        }
    }

    pub fn get(&self, key: &AdapterKey) -> Option<ProviderStats> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<AdapterKey, ProviderStats> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
