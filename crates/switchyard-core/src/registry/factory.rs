//! Adapter factories

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_config::ConnectionSettings;

use crate::adapter::{AdapterDeps, AdapterHandle};

/// Builds adapter instances from resolved connection settings
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self, settings: ConnectionSettings, deps: AdapterDeps) -> Result<AdapterHandle>;
}

/// Closure-backed factory
pub struct FnFactory<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> AdapterFactory for FnFactory<F>
where
    F: Fn(ConnectionSettings, AdapterDeps) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AdapterHandle>> + Send + 'static,
{
    async fn create(&self, settings: ConnectionSettings, deps: AdapterDeps) -> Result<AdapterHandle> {
        (self.f)(settings, deps).await
    }
}

/// Wrap an async closure as a shareable factory
pub fn factory_fn<F, Fut>(f: F) -> Arc<dyn AdapterFactory>
where
    F: Fn(ConnectionSettings, AdapterDeps) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AdapterHandle>> + Send + 'static,
{
    Arc::new(FnFactory { f })
}

/// Descriptive metadata supplied at registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AdapterInfo {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
