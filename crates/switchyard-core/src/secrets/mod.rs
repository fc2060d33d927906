//! Secret resolution
//!
//! Connection settings refer to credentials as `secret://<name>`. The
//! [`SecretsResolver`] looks those names up in a chain of [`SecretStore`]s
//! and substitutes the plain values just before an adapter is constructed.

pub mod env;
pub mod file;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use switchyard_config::ConnectionSettings;
use tracing::debug;

use crate::error::{RegistryError, SecretsError};

pub use env::{EnvSecretStore, EnvSource};
pub use file::FileSecretStore;
pub use memory::MemorySecretStore;

/// Scheme marker for secret references
pub const SECRET_SCHEME: &str = "secret://";

/// Logical secret name in a reference, or `None` for plain values
pub fn parse_secret_ref(value: &str) -> Option<&str> {
    value
        .strip_prefix(SECRET_SCHEME)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

pub fn secret_ref(name: &str) -> String {
    format!("{}{}", SECRET_SCHEME, name)
}

/// One secrets backend
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Backend name used in "tried" lists and logs
    fn name(&self) -> &str;

    async fn get(&self, name: &str) -> Result<Option<String>, SecretsError>;

    async fn set(&self, name: &str, value: &str) -> Result<(), SecretsError>;

    /// Returns whether the secret existed
    async fn delete(&self, name: &str) -> Result<bool, SecretsError>;

    async fn list(&self) -> Result<Vec<String>, SecretsError>;
}

/// Ordered chain of stores. Lookups try each store in turn;
/// writes go to the first store.
#[derive(Clone, Default)]
pub struct SecretsResolver {
    stores: Vec<Arc<dyn SecretStore>>,
}

impl SecretsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn get_secret(&self, name: &str) -> Result<String, SecretsError> {
        let mut tried = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            tried.push(store.name().to_string());
            if let Some(value) = store.get(name).await? {
                debug!("Resolved secret '{}' from {} store", name, store.name());
                return Ok(value);
            }
        }
        Err(SecretsError::NotFound {
            name: name.to_string(),
            tried,
        })
    }

    pub async fn set_secret(&self, name: &str, value: &str) -> Result<(), SecretsError> {
        self.primary()?.set(name, value).await
    }

    pub async fn delete_secret(&self, name: &str) -> Result<bool, SecretsError> {
        self.primary()?.delete(name).await
    }

    /// Sorted union of every store's names
    pub async fn list_secrets(&self) -> Result<Vec<String>, SecretsError> {
        let mut names = BTreeSet::new();
        for store in &self.stores {
            names.extend(store.list().await?);
        }
        Ok(names.into_iter().collect())
    }

    /// Copy of `settings` with every secret reference replaced by its value
    pub async fn resolve_settings(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionSettings, RegistryError> {
        let value = settings.as_value();
        let mut names = BTreeSet::new();
        collect_refs(&value, &mut names);

        let mut resolved = BTreeMap::new();
        for name in names {
            let secret = self.get_secret(&name).await.map_err(|source| {
                RegistryError::SecretResolutionFailed {
                    name: name.clone(),
                    source,
                }
            })?;
            resolved.insert(name, secret);
        }

        match substitute(value, &resolved) {
            Value::Object(map) => Ok(ConnectionSettings(map)),
            _ => Ok(settings.clone()),
        }
    }

    fn primary(&self) -> Result<&Arc<dyn SecretStore>, SecretsError> {
        self.stores.first().ok_or_else(|| SecretsError::Backend {
            backend: "resolver".to_string(),
            message: "no secret stores configured".to_string(),
        })
    }
}

/// Whether any string at any depth is a secret reference
pub fn contains_secret_refs(settings: &ConnectionSettings) -> bool {
    let mut names = BTreeSet::new();
    collect_refs(&settings.as_value(), &mut names);
    !names.is_empty()
}

fn collect_refs(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(name) = parse_secret_ref(s) {
                names.insert(name.to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, names)),
        _ => {}
    }
}

fn substitute(value: Value, resolved: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => match parse_secret_ref(&s).and_then(|name| resolved.get(name)) {
            Some(secret) => Value::String(secret.clone()),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, resolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, resolved)))
                .collect(),
        ),
        other => other,
    }
}
