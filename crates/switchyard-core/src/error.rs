//! Registry and secrets errors

use std::sync::Arc;

use switchyard_config::ProviderType;
use thiserror::Error;

/// Shared cause carried by [`RegistryError`]. Errors are cloned to every
/// caller waiting on the same adapter construction.
pub type SharedCause = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Error)]
pub enum SecretsError {
    #[error("secret '{name}' not found (tried: {})", .tried.join(", "))]
    NotFound { name: String, tried: Vec<String> },

    #[error("{backend} secret store failed: {message}")]
    Backend { backend: String, message: String },
}

impl SecretsError {
    pub(crate) fn backend(backend: &str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("no configuration for adapter type '{0}'")]
    ConfigurationMissing(ProviderType),

    #[error("no provider resolves for adapter type '{0}'")]
    NoDefaultProvider(ProviderType),

    #[error("failed to construct {provider_type} adapter '{provider_id}': {source}")]
    AdapterConstructionFailed {
        provider_type: ProviderType,
        provider_id: String,
        #[source]
        source: SharedCause,
    },

    #[error("failed to resolve secret '{name}': {source}")]
    SecretResolutionFailed {
        name: String,
        #[source]
        source: SecretsError,
    },
}

impl RegistryError {
    pub(crate) fn construction_failed(
        provider_type: ProviderType,
        provider_id: &str,
        cause: anyhow::Error,
    ) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync> = cause.into();
        Self::AdapterConstructionFailed {
            provider_type,
            provider_id: provider_id.to_string(),
            source: Arc::from(boxed),
        }
    }

    /// Construction failed on another registry error (a secret, usually)
    pub(crate) fn construction_failed_on(
        provider_type: ProviderType,
        provider_id: &str,
        cause: RegistryError,
    ) -> Self {
        Self::AdapterConstructionFailed {
            provider_type,
            provider_id: provider_id.to_string(),
            source: Arc::new(cause),
        }
    }

    /// The secret failure behind this error, if construction failed on a secret
    pub fn secret_failure(&self) -> Option<(&str, &SecretsError)> {
        match self {
            Self::SecretResolutionFailed { name, source } => Some((name, source)),
            Self::AdapterConstructionFailed { source, .. } => source
                .downcast_ref::<RegistryError>()
                .and_then(RegistryError::secret_failure),
            _ => None,
        }
    }
}
