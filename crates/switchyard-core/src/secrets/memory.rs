//! In-memory secret store

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::SecretStore;
use crate::error::SecretsError;

/// Plain map, nothing persisted
pub struct MemorySecretStore {
    name: String,
    secrets: RwLock<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secrets: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_secret(self, name: &str, value: &str) -> Self {
        self.secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), value.to_string());
        self
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, name: &str) -> Result<Option<String>, SecretsError> {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(secrets.get(name).cloned())
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), SecretsError> {
        self.secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, SecretsError> {
        let removed = self
            .secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
        Ok(removed.is_some())
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        let secrets = self
            .secrets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(secrets.keys().cloned().collect())
    }
}
