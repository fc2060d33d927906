//! In-memory config watcher for tests and embedding

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ConfigError;
use crate::model::{ConnectionSettings, ProviderType, RegistryConfig, Scope};
use crate::watcher::{ConfigEvent, ConfigState, ConfigWatcher};

/// Watcher whose configuration is only changed through its mutators.
///
/// Each mutator is a copy-on-write update that notifies subscribers only
/// when the configuration actually changes.
pub struct MemoryConfigWatcher {
    state: ConfigState,
}

impl MemoryConfigWatcher {
    pub fn new(initial: RegistryConfig) -> Self {
        Self {
            state: ConfigState::new(initial),
        }
    }

    pub fn set_default_provider(&self, provider_type: ProviderType, provider_id: &str) -> bool {
        self.state.update(|config| {
            config
                .providers
                .entry(provider_type)
                .or_default()
                .set_at_scope(None, provider_id);
        })
    }

    pub fn set_scoped_provider(
        &self,
        provider_type: ProviderType,
        scope: Scope,
        scope_id: &str,
        provider_id: &str,
    ) -> bool {
        self.state.update(|config| {
            config
                .providers
                .entry(provider_type)
                .or_default()
                .set_at_scope(Some((scope, scope_id)), provider_id);
        })
    }

    pub fn update_provider_config(&self, provider_id: &str, settings: ConnectionSettings) -> bool {
        self.state.update(|config| {
            config
                .provider_configs
                .insert(provider_id.to_string(), settings);
        })
    }

    pub fn replace(&self, config: RegistryConfig) -> bool {
        self.state.replace(config)
    }
}

impl Default for MemoryConfigWatcher {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[async_trait]
impl ConfigWatcher for MemoryConfigWatcher {
    async fn start(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn current(&self) -> Arc<RegistryConfig> {
        self.state.current()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.state.subscribe()
    }
}
