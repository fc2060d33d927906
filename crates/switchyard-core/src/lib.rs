//! switchyard-core - runtime provider adapter management
//!
//! This crate provides:
//! - A provider registry that resolves, constructs and caches adapters per
//!   context, with single-flight construction and diff-based invalidation
//! - Error normalization into a closed taxonomy with retry helpers
//! - Secret resolution over chained env, file and in-memory stores
//! - Per-call metrics collection with tracing and batched database sinks

pub mod adapter;
pub mod context;
pub mod error;
pub mod events;
pub mod metrics;
pub mod normalize;
pub mod registry;
pub mod secrets;

// Re-export main types for convenience
pub use adapter::{
    Adapter, AdapterCapabilities, AdapterDeps, AdapterHandle, ChatMessage, ChatRequest,
    ChatResponse, ChatRole, EmbeddingsAdapter, ImageAdapter, LlmAdapter, SttAdapter, TtsAdapter,
};
pub use context::CallContext;
pub use error::{RegistryError, SecretsError};
pub use events::{EventBus, RegistryEvent};
pub use metrics::{
    BatchOptions, BatchingSink, CallMetrics, MetricsCollector, MetricsContext, MetricsSink,
    TracingSink,
};
pub use normalize::{
    ClassifiedError, ErrorContext, ErrorKind, ProviderFailure, is_retryable, normalize, redact,
    retry_delay,
};
pub use registry::{
    AdapterFactory, AdapterInfo, AdapterKey, ProviderInfo, ProviderRegistry, ProviderStats,
    RegistryBuilder, factory_fn,
};
pub use secrets::{
    EnvSecretStore, FileSecretStore, MemorySecretStore, SecretStore, SecretsResolver,
};
