//! Environment-variable secret store

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use super::SecretStore;
use super::file::FileSecretStore;
use crate::error::SecretsError;

/// Prefix for secret environment variables
pub const DEFAULT_ENV_PREFIX: &str = "SWITCHYARD_SECRET_";

/// Where variables are read from
#[derive(Debug, Clone)]
pub enum EnvSource {
    Process,
    /// Fixed variables, for tests and embedding
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    fn var(&self, key: &str) -> Option<String> {
        match self {
            Self::Process => std::env::var(key).ok(),
            Self::Fixed(vars) => vars.get(key).cloned(),
        }
    }

    fn vars(&self) -> Vec<(String, String)> {
        match self {
            Self::Process => std::env::vars().collect(),
            Self::Fixed(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// Read-mostly store backed by environment variables.
///
/// `openai.api-key` maps to `SWITCHYARD_SECRET_OPENAI_API_KEY`. Resolved
/// values are cached. An optional JSON file is consulted when the variable
/// is absent. `set`/`delete` only touch the cache.
pub struct EnvSecretStore {
    prefix: String,
    source: EnvSource,
    cache: Mutex<HashMap<String, String>>,
    fallback: Option<FileSecretStore>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            source: EnvSource::Process,
            cache: Mutex::new(HashMap::new()),
            fallback: None,
        }
    }

    pub fn with_source(mut self, source: EnvSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_fallback_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.fallback = Some(FileSecretStore::new(path));
        self
    }

    /// Environment variable holding `name`
    pub fn env_var_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().unwrap_or_else(|poisoned| {
            warn!("Secret cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    fn name(&self) -> &str {
        "env"
    }

    async fn get(&self, name: &str) -> Result<Option<String>, SecretsError> {
        if let Some(value) = self.cache().get(name) {
            return Ok(Some(value.clone()));
        }

        let value = match self.source.var(&self.env_var_name(name)) {
            Some(value) => Some(value),
            None => match &self.fallback {
                Some(file) => file.get(name).await?,
                None => None,
            },
        };

        if let Some(value) = &value {
            self.cache().insert(name.to_string(), value.clone());
        }
        Ok(value)
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), SecretsError> {
        warn!(
            "Secret '{}' set in memory only; export {} to make it durable",
            name,
            self.env_var_name(name)
        );
        self.cache().insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, SecretsError> {
        warn!(
            "Secret '{}' removed from the in-memory cache only; {} is unchanged",
            name,
            self.env_var_name(name)
        );
        Ok(self.cache().remove(name).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        let mut names: BTreeSet<String> = self.cache().keys().cloned().collect();
        for (key, _) in self.source.vars() {
            if let Some(suffix) = key.strip_prefix(&self.prefix) {
                if !suffix.is_empty() {
                    names.insert(suffix.to_lowercase());
                }
            }
        }
        if let Some(file) = &self.fallback {
            names.extend(file.list().await?);
        }
        Ok(names.into_iter().collect())
    }
}
