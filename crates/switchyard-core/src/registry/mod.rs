//! Provider registry
//!
//! Holds adapter factories keyed by `(type, id)`, resolves which provider
//! serves a call context, and lazily constructs and caches adapter instances.
//!
//! The configuration snapshot and the instance cache live behind one lock, so
//! readers always see mappings and connection settings from the same
//! generation. Construction runs outside the lock as a shared future: every
//! concurrent caller for a key awaits the same construction.

pub mod factory;
pub mod invalidation;
pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use switchyard_config::{
    ConfigEvent, ConfigWatcher, ConnectionSettings, ProviderMapping, ProviderType, RegistryConfig,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{
    AdapterDeps, AdapterHandle, EmbeddingsAdapter, ImageAdapter, LlmAdapter, SttAdapter, TtsAdapter,
};
use crate::context::CallContext;
use crate::error::RegistryError;
use crate::events::{EventBus, RegistryEvent};
use crate::secrets::{SecretsResolver, contains_secret_refs};

pub use factory::{AdapterFactory, AdapterInfo, FnFactory, factory_fn};
pub use invalidation::Invalidation;
pub use stats::ProviderStats;

use stats::StatsTable;

/// Cache key for adapter instances and statistics
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdapterKey {
    pub provider_type: ProviderType,
    pub provider_id: String,
}

impl AdapterKey {
    pub fn new(provider_type: ProviderType, provider_id: impl Into<String>) -> Self {
        Self {
            provider_type,
            provider_id: provider_id.into(),
        }
    }
}

impl std::fmt::Display for AdapterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider_type, self.provider_id)
    }
}

/// Snapshot of one registered adapter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub provider_type: ProviderType,
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Has a cached instance
    pub is_active: bool,
    pub error_count: u64,
    pub success_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

type Construction = Shared<BoxFuture<'static, Result<AdapterHandle, RegistryError>>>;

enum Slot {
    Ready(AdapterHandle),
    Pending { flight: u64, construction: Construction },
}

enum Lookup {
    Hit(AdapterHandle),
    Wait(Construction),
    Miss,
}

#[derive(Clone)]
struct FactoryEntry {
    factory: Arc<dyn AdapterFactory>,
    info: AdapterInfo,
}

struct State {
    config: Arc<RegistryConfig>,
    factories: HashMap<AdapterKey, FactoryEntry>,
    instances: HashMap<AdapterKey, Slot>,
    next_flight: u64,
}

impl State {
    fn resolve(
        &self,
        provider_type: ProviderType,
        context: &CallContext,
    ) -> Result<String, RegistryError> {
        let mapping = self
            .config
            .mapping(provider_type)
            .ok_or(RegistryError::ConfigurationMissing(provider_type))?;
        mapping
            .resolve(context.session_id(), context.campaign_id())
            .map(str::to_string)
            .ok_or(RegistryError::NoDefaultProvider(provider_type))
    }

    /// Swap in a new snapshot and drop the instances it invalidates
    fn apply_config(&mut self, config: Arc<RegistryConfig>) -> Vec<AdapterKey> {
        let invalidation = Invalidation::diff(&self.config, &config);
        self.config = config;
        if invalidation.is_empty() {
            return Vec::new();
        }

        let mut dropped: Vec<AdapterKey> = self
            .instances
            .keys()
            .filter(|key| invalidation.matches(key))
            .cloned()
            .collect();
        self.instances.retain(|key, _| !invalidation.matches(key));
        dropped.sort();
        dropped
    }
}

struct RegistryInner {
    state: Mutex<State>,
    stats: StatsTable,
    events: EventBus,
    secrets: SecretsResolver,
    deps: AdapterDeps,
}

impl RegistryInner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Cache a finished construction if its slot is still the one it started in
    fn finish_construction(
        &self,
        key: &AdapterKey,
        flight: u64,
        result: &Result<AdapterHandle, RegistryError>,
    ) {
        let mut state = self.lock_state();
        let current = matches!(
            state.instances.get(key),
            Some(Slot::Pending { flight: f, .. }) if *f == flight
        );

        match result {
            Ok(handle) => {
                if current {
                    state.instances.insert(key.clone(), Slot::Ready(handle.clone()));
                } else {
                    debug!("{} was invalidated during construction, not caching", key);
                }
                drop(state);
                self.stats.record_success(key);
                info!("Constructed {} adapter", key);
            }
            Err(err) => {
                if current {
                    state.instances.remove(key);
                }
                debug!("Construction of {} failed: {}", key, err);
            }
        }
    }
}

/// Builder for [`ProviderRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
    secrets: SecretsResolver,
    deps: Option<AdapterDeps>,
    event_capacity: Option<usize>,
}

impl RegistryBuilder {
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn secrets(mut self, secrets: SecretsResolver) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn deps(mut self, deps: AdapterDeps) -> Self {
        self.deps = Some(deps);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> ProviderRegistry {
        let events = match self.event_capacity {
            Some(capacity) => EventBus::new(capacity),
            None => EventBus::default(),
        };
        ProviderRegistry {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(State {
                    config: Arc::new(self.config),
                    factories: HashMap::new(),
                    instances: HashMap::new(),
                    next_flight: 0,
                }),
                stats: StatsTable::default(),
                events,
                secrets: self.secrets,
                deps: self.deps.unwrap_or_default(),
            }),
        }
    }
}

/// Registry of adapter factories and their live instances.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProviderRegistry {
    inner: Arc<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Register (or replace) the factory for `(provider_type, provider_id)`
    pub fn register(
        &self,
        provider_type: ProviderType,
        provider_id: &str,
        factory: Arc<dyn AdapterFactory>,
        mut info: AdapterInfo,
    ) {
        if info.display_name.is_empty() {
            info.display_name = provider_id.to_string();
        }
        let key = AdapterKey::new(provider_type, provider_id);
        self.inner
            .lock_state()
            .factories
            .insert(key.clone(), FactoryEntry { factory, info });
        self.inner.stats.ensure(&key);

        info!("Registered {} adapter", key);
        self.inner.events.publish(RegistryEvent::Registered {
            provider_type,
            provider_id: provider_id.to_string(),
        });
    }

    /// Remove a factory with its cached instance and statistics.
    /// Returns whether anything was registered.
    pub fn unregister(&self, provider_type: ProviderType, provider_id: &str) -> bool {
        let key = AdapterKey::new(provider_type, provider_id);
        let existed = {
            let mut state = self.inner.lock_state();
            state.instances.remove(&key);
            state.factories.remove(&key).is_some()
        };
        self.inner.stats.remove(&key);

        if existed {
            info!("Unregistered {} adapter", key);
            self.inner.events.publish(RegistryEvent::Unregistered {
                provider_type,
                provider_id: provider_id.to_string(),
            });
        }
        existed
    }

    /// Provider id serving `provider_type` for this context
    pub fn resolve(
        &self,
        provider_type: ProviderType,
        context: &CallContext,
    ) -> Result<String, RegistryError> {
        self.inner.lock_state().resolve(provider_type, context)
    }

    /// Resolve and return the adapter instance for this context, constructing it if needed
    pub async fn get(
        &self,
        provider_type: ProviderType,
        context: &CallContext,
    ) -> Result<AdapterHandle, RegistryError> {
        let (key, construction) = {
            let mut state = self.inner.lock_state();
            let provider_id = match state.resolve(provider_type, context) {
                Ok(id) => id,
                Err(err) => {
                    drop(state);
                    warn!("Failed to resolve {} provider for {}: {}", provider_type, context, err);
                    self.inner.events.publish(RegistryEvent::Error {
                        provider_type,
                        provider_id: None,
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            };
            let key = AdapterKey::new(provider_type, provider_id);
            let lookup = match state.instances.get(&key) {
                Some(Slot::Ready(handle)) => Lookup::Hit(handle.clone()),
                Some(Slot::Pending { construction, .. }) => Lookup::Wait(construction.clone()),
                None => Lookup::Miss,
            };
            match lookup {
                Lookup::Hit(handle) => {
                    drop(state);
                    self.inner.stats.touch(&key);
                    return Ok(handle);
                }
                Lookup::Wait(construction) => {
                    debug!("Joining in-flight construction of {}", key);
                    (key, Ok(construction))
                }
                Lookup::Miss => {
                    let construction = self.start_construction(&mut state, &key);
                    (key, construction)
                }
            }
        };

        let result = match construction {
            Ok(construction) => construction.await,
            Err(err) => Err(err),
        };

        match result {
            Ok(handle) => {
                self.inner.stats.touch(&key);
                Ok(handle)
            }
            Err(err) => {
                self.inner.stats.record_error(&key);
                warn!("Failed to get {} adapter: {}", key, err);
                self.inner.events.publish(RegistryEvent::Error {
                    provider_type: key.provider_type,
                    provider_id: Some(key.provider_id.clone()),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn start_construction(
        &self,
        state: &mut State,
        key: &AdapterKey,
    ) -> Result<Construction, RegistryError> {
        let entry = state.factories.get(key).cloned().ok_or_else(|| {
            RegistryError::construction_failed(
                key.provider_type,
                &key.provider_id,
                anyhow!("no adapter registered for {}", key),
            )
        })?;
        let settings = match state.config.settings(&key.provider_id) {
            Some(settings) => settings.clone(),
            None => {
                debug!("No connection settings for '{}', using empty settings", key.provider_id);
                ConnectionSettings::new()
            }
        };

        state.next_flight += 1;
        let flight = state.next_flight;
        let construction = construct(
            Arc::downgrade(&self.inner),
            key.clone(),
            flight,
            entry.factory,
            settings,
            self.inner.secrets.clone(),
            self.inner.deps.clone(),
        )
        .boxed()
        .shared();

        state.instances.insert(
            key.clone(),
            Slot::Pending {
                flight,
                construction: construction.clone(),
            },
        );
        Ok(construction)
    }

    pub async fn get_llm(&self, context: &CallContext) -> Result<Arc<dyn LlmAdapter>, RegistryError> {
        let handle = self.get(ProviderType::Llm, context).await?;
        let provider_id = handle.describe().provider_id;
        handle
            .into_llm()
            .ok_or_else(|| mismatch(ProviderType::Llm, &provider_id))
    }

    pub async fn get_stt(&self, context: &CallContext) -> Result<Arc<dyn SttAdapter>, RegistryError> {
        let handle = self.get(ProviderType::Stt, context).await?;
        let provider_id = handle.describe().provider_id;
        handle
            .into_stt()
            .ok_or_else(|| mismatch(ProviderType::Stt, &provider_id))
    }

    pub async fn get_tts(&self, context: &CallContext) -> Result<Arc<dyn TtsAdapter>, RegistryError> {
        let handle = self.get(ProviderType::Tts, context).await?;
        let provider_id = handle.describe().provider_id;
        handle
            .into_tts()
            .ok_or_else(|| mismatch(ProviderType::Tts, &provider_id))
    }

    pub async fn get_image(
        &self,
        context: &CallContext,
    ) -> Result<Arc<dyn ImageAdapter>, RegistryError> {
        let handle = self.get(ProviderType::Image, context).await?;
        let provider_id = handle.describe().provider_id;
        handle
            .into_image()
            .ok_or_else(|| mismatch(ProviderType::Image, &provider_id))
    }

    pub async fn get_embeddings(
        &self,
        context: &CallContext,
    ) -> Result<Arc<dyn EmbeddingsAdapter>, RegistryError> {
        let handle = self.get(ProviderType::Embeddings, context).await?;
        let provider_id = handle.describe().provider_id;
        handle
            .into_embeddings()
            .ok_or_else(|| mismatch(ProviderType::Embeddings, &provider_id))
    }

    /// Registered adapters of one type, sorted by display name
    pub fn list(&self, provider_type: ProviderType) -> Vec<ProviderInfo> {
        self.collect_infos(Some(provider_type))
    }

    /// Every registered adapter, sorted by display name
    pub fn list_all(&self) -> Vec<ProviderInfo> {
        self.collect_infos(None)
    }

    fn collect_infos(&self, filter: Option<ProviderType>) -> Vec<ProviderInfo> {
        let entries: Vec<(AdapterKey, AdapterInfo, bool)> = {
            let state = self.inner.lock_state();
            state
                .factories
                .iter()
                .filter(|(key, _)| filter.is_none_or(|t| key.provider_type == t))
                .map(|(key, entry)| {
                    let active = matches!(state.instances.get(key), Some(Slot::Ready(_)));
                    (key.clone(), entry.info.clone(), active)
                })
                .collect()
        };

        let mut infos: Vec<ProviderInfo> = entries
            .into_iter()
            .map(|(key, info, is_active)| {
                let stats = self.inner.stats.get(&key).unwrap_or_default();
                ProviderInfo {
                    provider_type: key.provider_type,
                    id: key.provider_id,
                    display_name: info.display_name,
                    description: info.description,
                    is_active,
                    error_count: stats.errors,
                    success_count: stats.successes,
                    last_used: stats.last_used,
                }
            })
            .collect();
        infos.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.provider_type.cmp(&b.provider_type))
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }

    /// Replace the configuration wholesale. Returns the cached instances dropped.
    pub fn update_config(&self, config: impl Into<Arc<RegistryConfig>>) -> Vec<AdapterKey> {
        let invalidated = self.inner.lock_state().apply_config(config.into());
        self.config_changed(invalidated)
    }

    /// Replace one type's provider mapping
    pub fn set_provider_config(
        &self,
        provider_type: ProviderType,
        mapping: ProviderMapping,
    ) -> Vec<AdapterKey> {
        let invalidated = {
            let mut state = self.inner.lock_state();
            let mut next = RegistryConfig::clone(&state.config);
            next.providers.insert(provider_type, mapping);
            state.apply_config(Arc::new(next))
        };
        self.config_changed(invalidated)
    }

    fn config_changed(&self, invalidated: Vec<AdapterKey>) -> Vec<AdapterKey> {
        if invalidated.is_empty() {
            debug!("Configuration updated, no cached adapters invalidated");
        } else {
            info!(
                "Configuration updated, dropped {} cached adapter(s)",
                invalidated.len()
            );
        }
        self.inner.events.publish(RegistryEvent::ConfigChanged {
            invalidated: invalidated.clone(),
        });
        invalidated
    }

    /// Point the most specific scope in `context` (session, else campaign,
    /// else the type default) at `provider_id`.
    ///
    /// Returns `false` without touching the configuration when `provider_id`
    /// already serves this context.
    pub fn hot_switch(
        &self,
        provider_type: ProviderType,
        provider_id: &str,
        context: &CallContext,
    ) -> bool {
        if provider_id.is_empty() {
            warn!("Ignoring hot-switch of {} to an empty provider id", provider_type);
            return false;
        }

        let from = {
            let mut state = self.inner.lock_state();
            let from = state.resolve(provider_type, context).ok();
            if from.as_deref() == Some(provider_id) {
                debug!(
                    "{} already served by '{}' for {}",
                    provider_type, provider_id, context
                );
                return false;
            }

            let mut next = RegistryConfig::clone(&state.config);
            next.providers
                .entry(provider_type)
                .or_default()
                .set_at_scope(context.most_specific_scope(), provider_id);
            state.apply_config(Arc::new(next));
            from
        };

        info!(
            "Hot-switched {} for {} from {} to {}",
            provider_type,
            context,
            from.as_deref().unwrap_or("<none>"),
            provider_id
        );
        self.inner.events.publish(RegistryEvent::HotSwitched {
            provider_type,
            from,
            to: provider_id.to_string(),
            context: context.clone(),
        });
        true
    }

    /// Drop every cached instance; factories, configuration and statistics are kept
    pub fn clear_instances(&self) {
        let mut state = self.inner.lock_state();
        let count = state.instances.len();
        state.instances.clear();
        debug!("Cleared {} cached adapter instance(s)", count);
    }

    pub fn get_config(&self) -> Arc<RegistryConfig> {
        Arc::clone(&self.inner.lock_state().config)
    }

    pub fn get_stats(&self) -> BTreeMap<AdapterKey, ProviderStats> {
        self.inner.stats.snapshot()
    }

    pub fn stats_for(&self, provider_type: ProviderType, provider_id: &str) -> Option<ProviderStats> {
        self.inner
            .stats
            .get(&AdapterKey::new(provider_type, provider_id))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Apply the watcher's configuration now and on every change until `shutdown`
    pub fn follow(
        &self,
        watcher: Arc<dyn ConfigWatcher>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = watcher.subscribe();
        self.update_config(watcher.current());

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Registry stopped following configuration");
                        break;
                    }
                    event = rx.recv() => match event {
                        Ok(ConfigEvent::Changed { current, .. }) => {
                            registry.update_config(current);
                        }
                        Ok(ConfigEvent::Error { message }) => {
                            warn!("Configuration reload failed, keeping previous: {}", message);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Missed {} configuration events, resyncing", skipped);
                            registry.update_config(watcher.current());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

fn mismatch(provider_type: ProviderType, provider_id: &str) -> RegistryError {
    RegistryError::construction_failed(
        provider_type,
        provider_id,
        anyhow!("cached adapter is not a {} adapter", provider_type),
    )
}

async fn construct(
    registry: Weak<RegistryInner>,
    key: AdapterKey,
    flight: u64,
    factory: Arc<dyn AdapterFactory>,
    settings: ConnectionSettings,
    secrets: SecretsResolver,
    deps: AdapterDeps,
) -> Result<AdapterHandle, RegistryError> {
    let result = build(&key, factory.as_ref(), settings, &secrets, deps).await;
    if let Some(inner) = registry.upgrade() {
        inner.finish_construction(&key, flight, &result);
    }
    result
}

async fn build(
    key: &AdapterKey,
    factory: &dyn AdapterFactory,
    settings: ConnectionSettings,
    secrets: &SecretsResolver,
    deps: AdapterDeps,
) -> Result<AdapterHandle, RegistryError> {
    let settings = if contains_secret_refs(&settings) {
        secrets.resolve_settings(&settings).await.map_err(|err| {
            RegistryError::construction_failed_on(key.provider_type, &key.provider_id, err)
        })?
    } else {
        settings
    };

    let handle = factory
        .create(settings, deps)
        .await
        .map_err(|err| RegistryError::construction_failed(key.provider_type, &key.provider_id, err))?;

    if handle.provider_type() != key.provider_type {
        return Err(RegistryError::construction_failed(
            key.provider_type,
            &key.provider_id,
            anyhow!("factory returned a {} adapter", handle.provider_type()),
        ));
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        Adapter, AdapterCapabilities, ChatRequest, ChatResponse, SpeechAudio, TtsAdapter,
    };
    use crate::secrets::MemorySecretStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use switchyard_config::{MemoryConfigWatcher, Scope};

    struct MockLlm {
        id: String,
    }

    impl Adapter for MockLlm {
        fn describe(&self) -> AdapterCapabilities {
            AdapterCapabilities::new(ProviderType::Llm, &self.id)
        }
    }

    #[async_trait]
    impl LlmAdapter for MockLlm {
        async fn chat(&self, _request: ChatRequest) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: format!("from {}", self.id),
                usage: None,
            })
        }
    }

    struct MockTts;

    impl Adapter for MockTts {
        fn describe(&self) -> AdapterCapabilities {
            AdapterCapabilities::new(ProviderType::Tts, "mock")
        }
    }

    #[async_trait]
    impl TtsAdapter for MockTts {
        async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> anyhow::Result<SpeechAudio> {
            Ok(SpeechAudio {
                bytes: Vec::new(),
                mime_type: "audio/mpeg".to_string(),
            })
        }
    }

    /// Factory that counts calls, can be slowed down and made to fail
    struct MockFactory {
        id: String,
        calls: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
        wrong_type: bool,
        last_settings: Mutex<Option<ConnectionSettings>>,
    }

    impl MockFactory {
        fn new(id: &str) -> Arc<Self> {
            Self::build(id, Duration::ZERO, false)
        }

        fn slow(id: &str, delay: Duration) -> Arc<Self> {
            Self::build(id, delay, false)
        }

        fn build(id: &str, delay: Duration, wrong_type: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                delay,
                fail: AtomicBool::new(false),
                wrong_type,
                last_settings: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AdapterFactory for MockFactory {
        async fn create(
            &self,
            settings: ConnectionSettings,
            _deps: AdapterDeps,
        ) -> anyhow::Result<AdapterHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_settings.lock().unwrap() = Some(settings);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            if self.wrong_type {
                return Ok(AdapterHandle::Tts(Arc::new(MockTts)));
            }
            Ok(AdapterHandle::Llm(Arc::new(MockLlm {
                id: self.id.clone(),
            })))
        }
    }

    fn test_config() -> RegistryConfig {
        let mut llm = ProviderMapping::with_default("openai");
        llm.per_campaign.insert("c1".to_string(), "ollama".to_string());
        llm.per_session.insert("s1".to_string(), "local".to_string());

        let mut config = RegistryConfig::default();
        config.providers.insert(ProviderType::Llm, llm);
        config
            .providers
            .insert(ProviderType::Embeddings, ProviderMapping::with_default("openai"));
        config.provider_configs.insert(
            "openai".to_string(),
            ConnectionSettings::new()
                .with("api_key", "secret://openai_api_key")
                .with("model", "gpt-4o-mini"),
        );
        config.provider_configs.insert(
            "ollama".to_string(),
            ConnectionSettings::new().with("base_url", "http://localhost:11434"),
        );
        config
            .provider_configs
            .insert("local".to_string(), ConnectionSettings::new());
        config
    }

    fn test_registry() -> ProviderRegistry {
        let store = MemorySecretStore::new().with_secret("openai_api_key", "sk-test");
        ProviderRegistry::builder()
            .config(test_config())
            .secrets(SecretsResolver::new().with_store(Arc::new(store)))
            .build()
    }

    fn register(registry: &ProviderRegistry, t: ProviderType, id: &str, f: &Arc<MockFactory>) {
        registry.register(t, id, f.clone(), AdapterInfo::new(id.to_uppercase()));
    }

    #[tokio::test]
    async fn test_cache_stability() {
        let registry = test_registry();
        let factory = MockFactory::new("openai");
        register(&registry, ProviderType::Llm, "openai", &factory);

        let ctx = CallContext::new();
        let first = registry.get(ProviderType::Llm, &ctx).await.unwrap();
        let second = registry.get(ProviderType::Llm, &ctx).await.unwrap();
        let third = registry.get(ProviderType::Llm, &ctx).await.unwrap();

        assert!(first.same_instance(&second));
        assert!(first.same_instance(&third));
        assert_eq!(factory.calls(), 1);

        let stats = registry.stats_for(ProviderType::Llm, "openai").unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.errors, 0);
        assert!(stats.last_used.is_some());
    }

    #[tokio::test]
    async fn test_single_flight_success() {
        let registry = test_registry();
        let factory = MockFactory::slow("openai", Duration::from_millis(50));
        register(&registry, ProviderType::Llm, "openai", &factory);

        let ctx = CallContext::new();
        let results = futures::future::join_all(
            (0..8).map(|_| registry.get(ProviderType::Llm, &ctx)),
        )
        .await;

        assert_eq!(factory.calls(), 1);
        let handles: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert!(handles.iter().all(|h| h.same_instance(&handles[0])));
        assert_eq!(
            registry.stats_for(ProviderType::Llm, "openai").unwrap().successes,
            1
        );
    }

    #[tokio::test]
    async fn test_single_flight_failure_is_shared_and_not_cached() {
        let registry = test_registry();
        let factory = MockFactory::slow("openai", Duration::from_millis(30));
        factory.fail.store(true, Ordering::SeqCst);
        register(&registry, ProviderType::Llm, "openai", &factory);
        let mut events = registry.subscribe();

        let ctx = CallContext::new();
        let results = futures::future::join_all(
            (0..4).map(|_| registry.get(ProviderType::Llm, &ctx)),
        )
        .await;

        assert_eq!(factory.calls(), 1);
        assert!(results.iter().all(|r| matches!(
            r,
            Err(RegistryError::AdapterConstructionFailed { provider_id, .. }) if provider_id == "openai"
        )));
        // every failed get counts, construction happened once
        let stats = registry.stats_for(ProviderType::Llm, "openai").unwrap();
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.successes, 0);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Error { .. })));

        factory.fail.store(false, Ordering::SeqCst);
        registry.get(ProviderType::Llm, &ctx).await.unwrap();
        assert_eq!(factory.calls(), 2);
        assert_eq!(
            registry.stats_for(ProviderType::Llm, "openai").unwrap().successes,
            1
        );
    }

    #[test]
    fn test_resolution_precedence() {
        let registry = test_registry();
        let both = CallContext::campaign("c1").with_session("s1");
        let reversed = CallContext::session("s1").with_campaign("c1");

        assert_eq!(registry.resolve(ProviderType::Llm, &both).unwrap(), "local");
        assert_eq!(registry.resolve(ProviderType::Llm, &reversed).unwrap(), "local");
        assert_eq!(
            registry
                .resolve(ProviderType::Llm, &CallContext::campaign("c1"))
                .unwrap(),
            "ollama"
        );
        assert_eq!(
            registry.resolve(ProviderType::Llm, &CallContext::new()).unwrap(),
            "openai"
        );
        // unknown session falls through to the campaign
        let unknown_session = CallContext::campaign("c1").with_session("other");
        assert_eq!(
            registry.resolve(ProviderType::Llm, &unknown_session).unwrap(),
            "ollama"
        );
    }

    #[test]
    fn test_resolution_errors() {
        let registry = test_registry();
        assert!(matches!(
            registry.resolve(ProviderType::Tts, &CallContext::new()),
            Err(RegistryError::ConfigurationMissing(ProviderType::Tts))
        ));

        registry.set_provider_config(ProviderType::Stt, ProviderMapping::with_default(""));
        assert!(matches!(
            registry.resolve(ProviderType::Stt, &CallContext::new()),
            Err(RegistryError::NoDefaultProvider(ProviderType::Stt))
        ));
    }

    #[tokio::test]
    async fn test_get_without_mapping_publishes_error() {
        let registry = ProviderRegistry::builder()
            .config(RegistryConfig::default())
            .event_capacity(0)
            .build();
        let mut events = registry.subscribe();

        let err = registry
            .get(ProviderType::Llm, &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConfigurationMissing(ProviderType::Llm)));
        match events.try_recv() {
            Ok(RegistryEvent::Error {
                provider_type,
                provider_id,
                message,
            }) => {
                assert_eq!(provider_type, ProviderType::Llm);
                assert_eq!(provider_id, None);
                assert_eq!(message, err.to_string());
            }
            other => panic!("expected error event, got {:?}", other),
        }
        assert!(registry.stats_for(ProviderType::Llm, "").is_none());
    }

    #[tokio::test]
    async fn test_hot_switch_noop_and_single_event() {
        let registry = test_registry();
        let mut events = registry.subscribe();
        let before = registry.get_config();

        assert!(!registry.hot_switch(ProviderType::Llm, "openai", &CallContext::new()));
        assert!(!registry.hot_switch(ProviderType::Llm, "local", &CallContext::session("s1")));
        assert!(Arc::ptr_eq(&before, &registry.get_config()));
        assert!(events.try_recv().is_err());

        let ctx = CallContext::campaign("c9").with_session("s2");
        assert!(registry.hot_switch(ProviderType::Llm, "ollama", &ctx));

        match events.try_recv().unwrap() {
            RegistryEvent::HotSwitched {
                provider_type,
                from,
                to,
                context,
            } => {
                assert_eq!(provider_type, ProviderType::Llm);
                assert_eq!(from.as_deref(), Some("openai"));
                assert_eq!(to, "ollama");
                assert_eq!(context, ctx);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());

        // only the session scope was written
        let config = registry.get_config();
        let mapping = config.mapping(ProviderType::Llm).unwrap();
        assert_eq!(mapping.at_scope(Some((Scope::Session, "s2"))), Some("ollama"));
        assert_eq!(mapping.at_scope(Some((Scope::Campaign, "c9"))), None);
        assert_eq!(mapping.default.as_deref(), Some("openai"));
    }

    #[test]
    fn test_hot_switch_scope_fallbacks() {
        let registry = test_registry();

        assert!(registry.hot_switch(ProviderType::Llm, "local", &CallContext::campaign("c2")));
        assert!(registry.hot_switch(ProviderType::Embeddings, "ollama", &CallContext::new()));

        let config = registry.get_config();
        assert_eq!(
            config
                .mapping(ProviderType::Llm)
                .unwrap()
                .at_scope(Some((Scope::Campaign, "c2"))),
            Some("local")
        );
        assert_eq!(
            config.mapping(ProviderType::Embeddings).unwrap().default.as_deref(),
            Some("ollama")
        );
        assert_eq!(
            registry.resolve(ProviderType::Llm, &CallContext::new()).unwrap(),
            "openai"
        );
    }

    #[tokio::test]
    async fn test_targeted_invalidation() {
        let registry = test_registry();
        let openai = MockFactory::new("openai");
        let ollama = MockFactory::new("ollama");
        register(&registry, ProviderType::Llm, "openai", &openai);
        register(&registry, ProviderType::Llm, "ollama", &ollama);
        let embed = factory_fn(|_, _| async {
            Ok::<_, anyhow::Error>(AdapterHandle::Embeddings(Arc::new(MockEmbeddings)))
        });
        registry.register(ProviderType::Embeddings, "openai", embed, AdapterInfo::default());

        let default_ctx = CallContext::new();
        let campaign_ctx = CallContext::campaign("c1");
        let llm_openai = registry.get(ProviderType::Llm, &default_ctx).await.unwrap();
        let emb_openai = registry.get(ProviderType::Embeddings, &default_ctx).await.unwrap();
        let llm_ollama = registry.get(ProviderType::Llm, &campaign_ctx).await.unwrap();

        // unrelated change: a provider nothing is cached for
        let mut next = RegistryConfig::clone(&registry.get_config());
        next.provider_configs
            .insert("unused".to_string(), ConnectionSettings::new());
        assert!(registry.update_config(next).is_empty());
        assert!(llm_openai.same_instance(&registry.get(ProviderType::Llm, &default_ctx).await.unwrap()));

        // settings change: that provider, every type
        let mut next = RegistryConfig::clone(&registry.get_config());
        next.provider_configs
            .get_mut("openai")
            .unwrap()
            .insert("model", "gpt-4o");
        let dropped = registry.update_config(next);
        assert_eq!(
            dropped,
            vec![
                AdapterKey::new(ProviderType::Llm, "openai"),
                AdapterKey::new(ProviderType::Embeddings, "openai"),
            ]
        );
        let llm_openai2 = registry.get(ProviderType::Llm, &default_ctx).await.unwrap();
        let emb_openai2 = registry.get(ProviderType::Embeddings, &default_ctx).await.unwrap();
        assert!(!llm_openai.same_instance(&llm_openai2));
        assert!(!emb_openai.same_instance(&emb_openai2));
        assert!(llm_ollama.same_instance(&registry.get(ProviderType::Llm, &campaign_ctx).await.unwrap()));

        // mapping change: that type, every provider
        let mut mapping = registry.get_config().mapping(ProviderType::Llm).unwrap().clone();
        mapping.per_session.insert("s5".to_string(), "ollama".to_string());
        let dropped = registry.set_provider_config(ProviderType::Llm, mapping);
        assert_eq!(
            dropped,
            vec![
                AdapterKey::new(ProviderType::Llm, "ollama"),
                AdapterKey::new(ProviderType::Llm, "openai"),
            ]
        );
        assert!(emb_openai2.same_instance(&registry.get(ProviderType::Embeddings, &default_ctx).await.unwrap()));
        assert_eq!(openai.calls(), 2);
    }

    struct MockEmbeddings;

    impl Adapter for MockEmbeddings {
        fn describe(&self) -> AdapterCapabilities {
            AdapterCapabilities::new(ProviderType::Embeddings, "mock")
        }
    }

    #[async_trait]
    impl EmbeddingsAdapter for MockEmbeddings {
        async fn embed(&self, inputs: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    #[tokio::test]
    async fn test_config_changed_event_carries_invalidated() {
        let registry = test_registry();
        register(&registry, ProviderType::Llm, "openai", &MockFactory::new("openai"));
        registry.get(ProviderType::Llm, &CallContext::new()).await.unwrap();
        let mut events = registry.subscribe();

        let mut next = RegistryConfig::clone(&registry.get_config());
        next.provider_configs.remove("openai");
        registry.update_config(next);

        match events.recv().await.unwrap() {
            RegistryEvent::ConfigChanged { invalidated } => {
                assert_eq!(invalidated, vec![AdapterKey::new(ProviderType::Llm, "openai")]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_secrets_substituted_not_stored() {
        let registry = test_registry();
        let factory = MockFactory::new("openai");
        register(&registry, ProviderType::Llm, "openai", &factory);

        registry.get_llm(&CallContext::new()).await.unwrap();

        let seen = factory.last_settings.lock().unwrap().clone().unwrap();
        assert_eq!(seen.api_key(), Some("sk-test"));
        assert_eq!(seen.model(), Some("gpt-4o-mini"));
        assert_eq!(
            registry.get_config().settings("openai").unwrap().api_key(),
            Some("secret://openai_api_key")
        );
    }

    #[tokio::test]
    async fn test_secret_failure_surfaces() {
        let registry = ProviderRegistry::new(test_config());
        let factory = MockFactory::new("openai");
        register(&registry, ProviderType::Llm, "openai", &factory);
        let mut events = registry.subscribe();

        let err = registry
            .get(ProviderType::Llm, &CallContext::new())
            .await
            .unwrap_err();
        let (name, _) = err.secret_failure().unwrap();
        assert_eq!(name, "openai_api_key");
        assert_eq!(factory.calls(), 0);
        assert_eq!(registry.stats_for(ProviderType::Llm, "openai").unwrap().errors, 1);
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_wrong_adapter_type_rejected() {
        let registry = test_registry();
        let factory = MockFactory::build("openai", Duration::ZERO, true);
        register(&registry, ProviderType::Llm, "openai", &factory);

        let err = registry.get_llm(&CallContext::new()).await.err().unwrap();
        assert!(err.to_string().contains("factory returned a tts adapter"));
    }

    #[tokio::test]
    async fn test_unregistered_provider_fails() {
        let registry = test_registry();
        let err = registry
            .get(ProviderType::Llm, &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AdapterConstructionFailed { .. }));
        assert!(registry.get_stats().is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = test_registry();
        let factory = MockFactory::new("openai");
        register(&registry, ProviderType::Llm, "openai", &factory);
        registry.get(ProviderType::Llm, &CallContext::new()).await.unwrap();
        let mut events = registry.subscribe();

        assert!(registry.unregister(ProviderType::Llm, "openai"));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Unregistered { .. })));
        assert!(registry.stats_for(ProviderType::Llm, "openai").is_none());
        assert!(registry.list(ProviderType::Llm).is_empty());

        assert!(!registry.unregister(ProviderType::Llm, "openai"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_sorted_with_live_state() {
        let registry = test_registry();
        registry.register(
            ProviderType::Llm,
            "openai",
            MockFactory::new("openai"),
            AdapterInfo::new("OpenAI"),
        );
        registry.register(
            ProviderType::Llm,
            "ollama",
            MockFactory::new("ollama"),
            AdapterInfo::new("Local Ollama").with_description("runs on localhost"),
        );
        registry.register(
            ProviderType::Tts,
            "elevenlabs",
            factory_fn(|_, _| async { Ok::<_, anyhow::Error>(AdapterHandle::Tts(Arc::new(MockTts))) }),
            AdapterInfo::new("ElevenLabs"),
        );
        registry.get(ProviderType::Llm, &CallContext::new()).await.unwrap();

        let llm = registry.list(ProviderType::Llm);
        let names: Vec<_> = llm.iter().map(|i| i.display_name.as_str()).collect();
        assert_eq!(names, vec!["Local Ollama", "OpenAI"]);
        assert!(!llm[0].is_active);
        assert!(llm[1].is_active);
        assert_eq!(llm[1].success_count, 1);

        let all: Vec<_> = registry
            .list_all()
            .into_iter()
            .map(|i| i.display_name)
            .collect();
        assert_eq!(all, vec!["ElevenLabs", "Local Ollama", "OpenAI"]);
    }

    #[tokio::test]
    async fn test_clear_instances_keeps_stats() {
        let registry = test_registry();
        let factory = MockFactory::new("openai");
        register(&registry, ProviderType::Llm, "openai", &factory);
        let ctx = CallContext::new();

        let first = registry.get(ProviderType::Llm, &ctx).await.unwrap();
        registry.clear_instances();
        assert!(!registry.list(ProviderType::Llm)[0].is_active);

        let second = registry.get(ProviderType::Llm, &ctx).await.unwrap();
        assert!(!first.same_instance(&second));
        assert_eq!(factory.calls(), 2);
        assert_eq!(
            registry.stats_for(ProviderType::Llm, "openai").unwrap().successes,
            2
        );
    }

    #[tokio::test]
    async fn test_invalidated_during_construction_not_cached() {
        let registry = test_registry();
        let factory = MockFactory::slow("openai", Duration::from_millis(100));
        register(&registry, ProviderType::Llm, "openai", &factory);

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get(ProviderType::Llm, &CallContext::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut next = RegistryConfig::clone(&registry.get_config());
        next.provider_configs
            .get_mut("openai")
            .unwrap()
            .insert("model", "gpt-4o");
        registry.update_config(next);

        let stale = pending.await.unwrap().unwrap();
        let fresh = registry.get(ProviderType::Llm, &CallContext::new()).await.unwrap();
        assert!(!stale.same_instance(&fresh));
        assert_eq!(factory.calls(), 2);
        assert_eq!(
            factory.last_settings.lock().unwrap().as_ref().unwrap().model(),
            Some("gpt-4o")
        );
    }

    #[tokio::test]
    async fn test_follow_applies_watcher_changes() {
        let registry = test_registry();
        let watcher = Arc::new(MemoryConfigWatcher::new(test_config()));
        let shutdown = CancellationToken::new();
        let handle = registry.follow(watcher.clone(), shutdown.clone());

        watcher.set_default_provider(ProviderType::Llm, "ollama");

        let resolved = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let id = registry.resolve(ProviderType::Llm, &CallContext::new()).unwrap();
                if id == "ollama" {
                    return id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(resolved, "ollama");

        shutdown.cancel();
        handle.await.unwrap();
    }
}
