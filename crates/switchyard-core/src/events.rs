//! Event bus for registry notifications

use std::sync::Arc;

use serde::Serialize;
use switchyard_config::ProviderType;
use tokio::sync::broadcast;
use tracing::debug;

use crate::context::CallContext;
use crate::registry::AdapterKey;

/// Something observable happened in the registry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered {
        provider_type: ProviderType,
        provider_id: String,
    },
    Unregistered {
        provider_type: ProviderType,
        provider_id: String,
    },
    /// Configuration replaced; `invalidated` lists the cached instances dropped
    ConfigChanged { invalidated: Vec<AdapterKey> },
    HotSwitched {
        provider_type: ProviderType,
        from: Option<String>,
        to: String,
        context: CallContext,
    },
    /// A `get` failed; `provider_id` is absent when nothing resolved
    Error {
        provider_type: ProviderType,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_id: Option<String>,
        message: String,
    },
}

impl RegistryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Unregistered { .. } => "unregistered",
            Self::ConfigChanged { .. } => "config_changed",
            Self::HotSwitched { .. } => "hot_switched",
            Self::Error { .. } => "error",
        }
    }
}

/// Broadcast bus; every current subscriber gets every event
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<RegistryEvent>>,
}

impl EventBus {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RegistryEvent) {
        let receivers = self.sender.receiver_count();
        if receivers > 0 {
            debug!("Publishing '{}' to {} receivers", event.name(), receivers);
            // No receivers is fine
            let _ = self.sender.send(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(RegistryEvent::Registered {
            provider_type: ProviderType::Llm,
            provider_id: "openai".to_string(),
        });

        assert_eq!(rx1.recv().await.unwrap().name(), "registered");
        assert_eq!(rx2.recv().await.unwrap().name(), "registered");
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(RegistryEvent::ConfigChanged {
            invalidated: Vec::new(),
        });
        assert_eq!(rx.recv().await.unwrap().name(), "config_changed");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(RegistryEvent::ConfigChanged {
            invalidated: Vec::new(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = RegistryEvent::HotSwitched {
            provider_type: ProviderType::Tts,
            from: Some("elevenlabs".to_string()),
            to: "openai".to_string(),
            context: CallContext::session("s1"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "hot_switched");
        assert_eq!(value["provider_type"], "tts");
        assert_eq!(value["context"]["session_id"], "s1");
    }
}
