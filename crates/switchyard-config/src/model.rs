//! Provider-selection configuration model
//!
//! A [`RegistryConfig`] is an immutable snapshot: watchers and the registry
//! share it as `Arc<RegistryConfig>` and replace it wholesale. Maps are
//! `BTreeMap`s so the serialized document has a stable key order.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// The fixed set of adapter types a configuration may map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Llm,
    Stt,
    Tts,
    Image,
    Embeddings,
}

impl ProviderType {
    pub const ALL: [ProviderType; 5] = [
        ProviderType::Llm,
        ProviderType::Stt,
        ProviderType::Tts,
        ProviderType::Image,
        ProviderType::Embeddings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Stt => "stt",
            Self::Tts => "tts",
            Self::Image => "image",
            Self::Embeddings => "embeddings",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "stt" => Ok(Self::Stt),
            "tts" => Ok(Self::Tts),
            "image" => Ok(Self::Image),
            "embeddings" => Ok(Self::Embeddings),
            _ => Err(ConfigError::UnknownProviderType(s.to_string())),
        }
    }
}

/// Scope dimension used to override the default provider.
///
/// `Session` is more specific than `Campaign` and always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Campaign,
    Session,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Campaign => write!(f, "campaign"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Which provider serves an adapter type, with optional scoped overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_campaign: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_session: BTreeMap<String, String>,
}

impl ProviderMapping {
    pub fn with_default(provider_id: impl Into<String>) -> Self {
        Self {
            default: Some(provider_id.into()),
            ..Self::default()
        }
    }

    /// Resolve the provider for the given scopes: session, then campaign, then default.
    /// Empty ids count as absent.
    pub fn resolve(&self, session_id: Option<&str>, campaign_id: Option<&str>) -> Option<&str> {
        let session = session_id.and_then(|s| self.per_session.get(s));
        let campaign = campaign_id.and_then(|c| self.per_campaign.get(c));
        session
            .or(campaign)
            .or(self.default.as_ref())
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Value set at exactly this scope (or the default when `scope` is `None`)
    pub fn at_scope(&self, scope: Option<(Scope, &str)>) -> Option<&str> {
        match scope {
            Some((Scope::Session, id)) => self.per_session.get(id).map(String::as_str),
            Some((Scope::Campaign, id)) => self.per_campaign.get(id).map(String::as_str),
            None => self.default.as_deref(),
        }
    }

    /// Write an override at one scope, leaving every other scope untouched
    pub fn set_at_scope(&mut self, scope: Option<(Scope, &str)>, provider_id: &str) {
        match scope {
            Some((Scope::Session, id)) => {
                self.per_session.insert(id.to_string(), provider_id.to_string());
            }
            Some((Scope::Campaign, id)) => {
                self.per_campaign.insert(id.to_string(), provider_id.to_string());
            }
            None => self.default = Some(provider_id.to_string()),
        }
    }

    /// Every provider id this mapping references
    pub fn referenced_ids(&self) -> impl Iterator<Item = &str> {
        self.default
            .iter()
            .chain(self.per_campaign.values())
            .chain(self.per_session.values())
            .map(String::as_str)
    }
}

/// Connection settings for one provider (base url, model, api key, ...).
///
/// Values may hold secret references (`secret://name`) at any depth; they are
/// resolved only when an adapter is constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionSettings(pub Map<String, Value>);

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn base_url(&self) -> Option<&str> {
        self.get_str("base_url")
    }

    pub fn model(&self) -> Option<&str> {
        self.get_str("model")
    }

    pub fn api_key(&self) -> Option<&str> {
        self.get_str("api_key")
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// The complete provider-selection configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default)]
    pub providers: BTreeMap<ProviderType, ProviderMapping>,
    #[serde(default)]
    pub provider_configs: BTreeMap<String, ConnectionSettings>,
}

impl RegistryConfig {
    pub fn mapping(&self, provider_type: ProviderType) -> Option<&ProviderMapping> {
        self.providers.get(&provider_type)
    }

    pub fn settings(&self, provider_id: &str) -> Option<&ConnectionSettings> {
        self.provider_configs.get(provider_id)
    }

    /// Provider ids referenced by a mapping but missing from `providerConfigs`
    pub fn dangling_references(&self) -> Vec<(ProviderType, String)> {
        let mut dangling = Vec::new();
        for (provider_type, mapping) in &self.providers {
            for id in mapping.referenced_ids() {
                if !self.provider_configs.contains_key(id)
                    && !dangling.iter().any(|(t, d)| t == provider_type && d == id)
                {
                    dangling.push((*provider_type, id.to_string()));
                }
            }
        }
        dangling
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(input).map_err(ConfigError::Json)?;
        validate_document(&value)
    }

    /// Stable pretty-printed JSON (trailing newline included)
    pub fn to_pretty_json(&self) -> Result<String, ConfigError> {
        let mut out = serde_json::to_string_pretty(self).map_err(ConfigError::Json)?;
        out.push('\n');
        Ok(out)
    }
}

/// Default configuration written when the watched file does not exist.
///
/// Every type defaults to a hosted provider; credentials are secret references
/// so the file never holds a plaintext key.
pub fn default_config() -> RegistryConfig {
    let mut providers = BTreeMap::new();
    providers.insert(ProviderType::Llm, ProviderMapping::with_default("openai"));
    providers.insert(ProviderType::Stt, ProviderMapping::with_default("openai"));
    providers.insert(ProviderType::Tts, ProviderMapping::with_default("elevenlabs"));
    providers.insert(ProviderType::Image, ProviderMapping::with_default("openai"));
    providers.insert(ProviderType::Embeddings, ProviderMapping::with_default("openai"));

    let mut provider_configs = BTreeMap::new();
    provider_configs.insert(
        "openai".to_string(),
        ConnectionSettings::new()
            .with("api_key", "secret://openai_api_key")
            .with("base_url", "https://api.openai.com/v1")
            .with("model", "gpt-4o-mini"),
    );
    provider_configs.insert(
        "ollama".to_string(),
        ConnectionSettings::new()
            .with("base_url", "http://localhost:11434")
            .with("model", "llama3.1:8b"),
    );
    provider_configs.insert(
        "elevenlabs".to_string(),
        ConnectionSettings::new()
            .with("api_key", "secret://elevenlabs_api_key")
            .with("base_url", "https://api.elevenlabs.io"),
    );

    RegistryConfig {
        providers,
        provider_configs,
    }
}

/// Validate a raw document and convert it into a [`RegistryConfig`].
///
/// The document must be an object with `providers` and `providerConfigs`
/// objects, every type key must be a known [`ProviderType`], and every type
/// entry must declare a non-empty `default`.
pub fn validate_document(value: &Value) -> Result<RegistryConfig, ConfigError> {
    let root = value
        .as_object()
        .ok_or_else(|| ConfigError::Invalid("configuration must be a JSON object".into()))?;

    let providers = root
        .get("providers")
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::Invalid("'providers' must be an object".into()))?;
    let provider_configs = root
        .get("providerConfigs")
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::Invalid("'providerConfigs' must be an object".into()))?;

    for (type_key, entry) in providers {
        let provider_type: ProviderType = type_key.parse()?;
        let entry = entry.as_object().ok_or_else(|| {
            ConfigError::Invalid(format!("providers.{} must be an object", type_key))
        })?;

        match entry.get("default").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingDefault(provider_type)),
        }

        for scoped in ["perCampaign", "perSession"] {
            if let Some(map) = entry.get(scoped) {
                let valid = map
                    .as_object()
                    .is_some_and(|m| m.values().all(|v| v.as_str().is_some_and(|s| !s.is_empty())));
                if !valid {
                    return Err(ConfigError::Invalid(format!(
                        "providers.{}.{} must map scope ids to provider ids",
                        type_key, scoped
                    )));
                }
            }
        }
    }

    for (id, settings) in provider_configs {
        if !settings.is_object() {
            return Err(ConfigError::Invalid(format!(
                "providerConfigs.{} must be an object",
                id
            )));
        }
    }

    serde_json::from_value(value.clone()).map_err(ConfigError::Json)
}
