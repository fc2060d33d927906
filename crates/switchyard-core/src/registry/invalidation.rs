//! Which cached instances a configuration change invalidates
//!
//! Computed by structural comparison of two immutable snapshots:
//! - a provider whose connection settings changed (added and removed
//!   included) loses its instances under every type
//! - a type whose mapping changed loses all its instances, whatever the provider
//!
//! Both rules apply together.

use std::collections::BTreeSet;

use switchyard_config::{ProviderType, RegistryConfig};

use super::AdapterKey;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    pub provider_ids: BTreeSet<String>,
    pub provider_types: BTreeSet<ProviderType>,
}

impl Invalidation {
    pub fn diff(old: &RegistryConfig, new: &RegistryConfig) -> Self {
        let provider_ids = old
            .provider_configs
            .keys()
            .chain(new.provider_configs.keys())
            .filter(|id| old.provider_configs.get(*id) != new.provider_configs.get(*id))
            .cloned()
            .collect();

        let provider_types = old
            .providers
            .keys()
            .chain(new.providers.keys())
            .filter(|t| old.providers.get(*t) != new.providers.get(*t))
            .copied()
            .collect();

        Self {
            provider_ids,
            provider_types,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.provider_ids.is_empty() && self.provider_types.is_empty()
    }

    pub fn matches(&self, key: &AdapterKey) -> bool {
        self.provider_ids.contains(&key.provider_id)
            || self.provider_types.contains(&key.provider_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_config::{ConnectionSettings, ProviderMapping, default_config};

    fn keys() -> Vec<AdapterKey> {
        vec![
            AdapterKey::new(ProviderType::Llm, "openai"),
            AdapterKey::new(ProviderType::Embeddings, "openai"),
            AdapterKey::new(ProviderType::Llm, "ollama"),
            AdapterKey::new(ProviderType::Tts, "elevenlabs"),
        ]
    }

    fn dropped(inv: &Invalidation) -> Vec<String> {
        keys()
            .into_iter()
            .filter(|k| inv.matches(k))
            .map(|k| k.to_string())
            .collect()
    }

    #[test]
    fn test_identical_configs_invalidate_nothing() {
        let inv = Invalidation::diff(&default_config(), &default_config());
        assert!(inv.is_empty());
        assert!(dropped(&inv).is_empty());
    }

    #[test]
    fn test_settings_change_hits_provider_across_types() {
        let old = default_config();
        let mut new = old.clone();
        new.provider_configs
            .get_mut("openai")
            .unwrap()
            .insert("model", "gpt-4o");

        let inv = Invalidation::diff(&old, &new);
        assert_eq!(dropped(&inv), vec!["llm:openai", "embeddings:openai"]);
    }

    #[test]
    fn test_added_and_removed_settings() {
        let old = default_config();
        let mut new = old.clone();
        new.provider_configs.remove("ollama");
        new.provider_configs
            .insert("local".to_string(), ConnectionSettings::new());

        let inv = Invalidation::diff(&old, &new);
        assert_eq!(
            inv.provider_ids,
            ["local", "ollama"].iter().map(|s| s.to_string()).collect()
        );
        assert!(inv.provider_types.is_empty());
    }

    #[test]
    fn test_mapping_change_hits_type_across_providers() {
        let old = default_config();
        let mut new = old.clone();
        new.providers
            .get_mut(&ProviderType::Llm)
            .unwrap()
            .per_session
            .insert("s1".to_string(), "ollama".to_string());

        let inv = Invalidation::diff(&old, &new);
        assert_eq!(dropped(&inv), vec!["llm:openai", "llm:ollama"]);
    }

    #[test]
    fn test_both_rules_union() {
        let old = default_config();
        let mut new = old.clone();
        new.providers
            .insert(ProviderType::Tts, ProviderMapping::with_default("openai"));
        new.provider_configs
            .get_mut("ollama")
            .unwrap()
            .insert("base_url", "http://gpu-box:11434");

        let inv = Invalidation::diff(&old, &new);
        assert_eq!(dropped(&inv), vec!["llm:ollama", "tts:elevenlabs"]);
    }
}
