//! Adapter contracts
//!
//! Each provider client implements the base [`Adapter`] trait plus the trait
//! for its capability. The registry hands adapters out as an
//! [`AdapterHandle`], one variant per [`ProviderType`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use switchyard_config::ProviderType;

use crate::metrics::MetricsSink;

/// What an adapter instance can do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    pub provider_id: String,
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl AdapterCapabilities {
    pub fn new(provider_type: ProviderType, provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider_type,
            model: None,
            streaming: false,
            features: Vec::new(),
        }
    }
}

/// Base contract every adapter satisfies
pub trait Adapter: Send + Sync {
    fn describe(&self) -> AdapterCapabilities;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One increment of a streamed chat response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatDelta {
    pub content: String,
    /// Usage, usually only on the final delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

#[async_trait]
pub trait LlmAdapter: Adapter {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Incremental deltas. Adapters without native streaming yield one delta.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let response = self.chat(request).await?;
        let delta = ChatDelta {
            content: response.content,
            usage: response.usage,
        };
        Ok(Box::pin(stream::once(async move { Ok(delta) })))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[async_trait]
pub trait SttAdapter: Adapter {
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> Result<Transcript>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
pub trait TtsAdapter: Adapter {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SpeechAudio>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedImage {
    Url(String),
    Bytes { data: Vec<u8>, mime_type: String },
}

#[async_trait]
pub trait ImageAdapter: Adapter {
    async fn generate(&self, prompt: &str, size: Option<&str>) -> Result<GeneratedImage>;
}

#[async_trait]
pub trait EmbeddingsAdapter: Adapter {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// A live adapter instance, tagged by capability
#[derive(Clone)]
pub enum AdapterHandle {
    Llm(Arc<dyn LlmAdapter>),
    Stt(Arc<dyn SttAdapter>),
    Tts(Arc<dyn TtsAdapter>),
    Image(Arc<dyn ImageAdapter>),
    Embeddings(Arc<dyn EmbeddingsAdapter>),
}

impl AdapterHandle {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::Llm(_) => ProviderType::Llm,
            Self::Stt(_) => ProviderType::Stt,
            Self::Tts(_) => ProviderType::Tts,
            Self::Image(_) => ProviderType::Image,
            Self::Embeddings(_) => ProviderType::Embeddings,
        }
    }

    pub fn describe(&self) -> AdapterCapabilities {
        match self {
            Self::Llm(a) => a.describe(),
            Self::Stt(a) => a.describe(),
            Self::Tts(a) => a.describe(),
            Self::Image(a) => a.describe(),
            Self::Embeddings(a) => a.describe(),
        }
    }

    /// Whether both handles point at the same instance
    pub fn same_instance(&self, other: &AdapterHandle) -> bool {
        match (self, other) {
            (Self::Llm(a), Self::Llm(b)) => Arc::ptr_eq(a, b),
            (Self::Stt(a), Self::Stt(b)) => Arc::ptr_eq(a, b),
            (Self::Tts(a), Self::Tts(b)) => Arc::ptr_eq(a, b),
            (Self::Image(a), Self::Image(b)) => Arc::ptr_eq(a, b),
            (Self::Embeddings(a), Self::Embeddings(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn into_llm(self) -> Option<Arc<dyn LlmAdapter>> {
        match self {
            Self::Llm(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_stt(self) -> Option<Arc<dyn SttAdapter>> {
        match self {
            Self::Stt(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_tts(self) -> Option<Arc<dyn TtsAdapter>> {
        match self {
            Self::Tts(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_image(self) -> Option<Arc<dyn ImageAdapter>> {
        match self {
            Self::Image(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_embeddings(self) -> Option<Arc<dyn EmbeddingsAdapter>> {
        match self {
            Self::Embeddings(a) => Some(a),
            _ => None,
        }
    }
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let caps = self.describe();
        f.debug_struct("AdapterHandle")
            .field("provider_type", &caps.provider_type)
            .field("provider_id", &caps.provider_id)
            .finish()
    }
}

/// Shared collaborators handed to every factory
#[derive(Clone)]
pub struct AdapterDeps {
    pub http: reqwest::Client,
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl AdapterDeps {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }
}

impl Default for AdapterDeps {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Echo;

    impl Adapter for Echo {
        fn describe(&self) -> AdapterCapabilities {
            AdapterCapabilities::new(ProviderType::Llm, "echo")
        }
    }

    #[async_trait]
    impl LlmAdapter for Echo {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
            let content = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse {
                content,
                usage: Some(Usage {
                    input_tokens: 3,
                    output_tokens: 3,
                }),
            })
        }
    }

    #[tokio::test]
    async fn test_default_stream_yields_single_delta() {
        let adapter = Echo;
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            ..ChatRequest::default()
        };
        let deltas: Vec<_> = adapter.chat_stream(request).await.unwrap().collect().await;
        assert_eq!(deltas.len(), 1);
        let delta = deltas[0].as_ref().unwrap();
        assert_eq!(delta.content, "hello");
        assert_eq!(delta.usage.unwrap().output_tokens, 3);
    }

    #[test]
    fn test_handle_identity_and_typing() {
        let a = AdapterHandle::Llm(Arc::new(Echo));
        let b = a.clone();
        let c = AdapterHandle::Llm(Arc::new(Echo));
        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
        assert_eq!(a.provider_type(), ProviderType::Llm);
        assert!(a.clone().into_tts().is_none());
        assert!(a.into_llm().is_some());
    }
}
