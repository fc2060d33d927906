//! Config watcher contract and the shared change-notification state

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::model::RegistryConfig;

const EVENT_CAPACITY: usize = 64;

/// Notification emitted by a watcher
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// The held configuration was replaced by a structurally different one
    Changed {
        previous: Arc<RegistryConfig>,
        current: Arc<RegistryConfig>,
    },
    /// A reload failed; the previous configuration stays in effect
    Error { message: String },
}

/// Owner of the live provider-selection configuration
#[async_trait]
pub trait ConfigWatcher: Send + Sync {
    /// Load the initial configuration and begin watching for changes
    async fn start(&self) -> Result<(), ConfigError>;

    /// Stop watching. No reload runs after this returns.
    async fn stop(&self);

    /// Snapshot of the configuration currently in effect
    fn current(&self) -> Arc<RegistryConfig>;

    /// Subscribe to change and error notifications
    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent>;
}

/// Current snapshot plus the broadcast channel every watcher backend uses.
///
/// Replacement is copy-on-write and only notifies when the new snapshot
/// differs structurally from the held one.
pub struct ConfigState {
    current: RwLock<Arc<RegistryConfig>>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ConfigState {
    pub fn new(initial: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current: RwLock::new(Arc::new(initial)),
            events,
        }
    }

    pub fn current(&self) -> Arc<RegistryConfig> {
        Arc::clone(&*self.read())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// Replace the configuration wholesale. Returns whether it changed.
    pub fn replace(&self, next: RegistryConfig) -> bool {
        self.update(|config| *config = next)
    }

    /// Apply a mutation to a copy of the current configuration and swap it in
    /// if the result differs. Returns whether it changed.
    pub fn update(&self, mutate: impl FnOnce(&mut RegistryConfig)) -> bool {
        let (previous, current) = {
            let mut guard = self.write();
            let mut next = (**guard).clone();
            mutate(&mut next);
            if next == **guard {
                debug!("Configuration unchanged, no notification sent");
                return false;
            }
            let current = Arc::new(next);
            let previous = std::mem::replace(&mut *guard, Arc::clone(&current));
            (previous, current)
        };

        // No subscribers is fine
        let _ = self.events.send(ConfigEvent::Changed { previous, current });
        true
    }

    /// Publish a reload failure without touching the held configuration
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Configuration error: {}", message);
        let _ = self.events.send(ConfigEvent::Error { message });
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<RegistryConfig>> {
        self.current.read().unwrap_or_else(|poisoned| {
            warn!("Config lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<RegistryConfig>> {
        self.current.write().unwrap_or_else(|poisoned| {
            warn!("Config lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for ConfigState {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
