//! JSON-file secret store

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::SecretStore;
use crate::error::SecretsError;

const BACKEND: &str = "file";

/// Secrets kept in a flat JSON object on disk.
///
/// The file is read on first access; every `set`/`delete` rewrites it with
/// owner-only permissions.
pub struct FileSecretStore {
    path: PathBuf,
    secrets: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            secrets: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(path: &Path) -> Result<BTreeMap<String, String>, SecretsError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => {
                let secrets: BTreeMap<String, String> = serde_json::from_str(&content)
                    .map_err(|e| SecretsError::backend(BACKEND, format!("{}: {}", path.display(), e)))?;
                debug!("Loaded {} secrets from {}", secrets.len(), path.display());
                Ok(secrets)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(SecretsError::backend(BACKEND, format!("{}: {}", path.display(), e))),
        }
    }

    async fn persist(&self, secrets: &BTreeMap<String, String>) -> Result<(), SecretsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SecretsError::backend(BACKEND, e))?;
        }
        let mut content =
            serde_json::to_string_pretty(secrets).map_err(|e| SecretsError::backend(BACKEND, e))?;
        content.push('\n');
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| SecretsError::backend(BACKEND, format!("{}: {}", self.path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| SecretsError::backend(BACKEND, e))?;
        }
        Ok(())
    }

    /// Run `f` against the loaded map, loading it on first use
    async fn with_secrets<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> T,
    ) -> Result<T, SecretsError> {
        let mut guard = self.secrets.lock().await;
        if guard.is_none() {
            *guard = Some(Self::load(&self.path).await?);
        }
        let secrets = guard.get_or_insert_with(BTreeMap::new);
        Ok(f(secrets))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn get(&self, name: &str) -> Result<Option<String>, SecretsError> {
        self.with_secrets(|secrets| secrets.get(name).cloned()).await
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), SecretsError> {
        let mut guard = self.secrets.lock().await;
        let mut secrets = match guard.take() {
            Some(secrets) => secrets,
            None => Self::load(&self.path).await?,
        };
        secrets.insert(name.to_string(), value.to_string());
        let result = self.persist(&secrets).await;
        *guard = Some(secrets);
        result?;
        info!("Stored secret '{}' in {}", name, self.path.display());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, SecretsError> {
        let mut guard = self.secrets.lock().await;
        let mut secrets = match guard.take() {
            Some(secrets) => secrets,
            None => Self::load(&self.path).await?,
        };
        let existed = secrets.remove(name).is_some();
        let result = if existed {
            self.persist(&secrets).await
        } else {
            Ok(())
        };
        *guard = Some(secrets);
        result?;
        if existed {
            info!("Deleted secret '{}' from {}", name, self.path.display());
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<String>, SecretsError> {
        self.with_secrets(|secrets| secrets.keys().cloned().collect())
            .await
    }
}
