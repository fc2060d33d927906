//! Per-call context

use serde::{Deserialize, Serialize};
use switchyard_config::Scope;

/// Who a provider call is for. Built per call and never persisted.
///
/// Session is the more specific scope; campaign the less specific one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn campaign(campaign_id: impl Into<String>) -> Self {
        Self::new().with_campaign(campaign_id)
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self::new().with_session(session_id)
    }

    pub fn with_campaign(mut self, campaign_id: impl Into<String>) -> Self {
        self.campaign_id = Some(campaign_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn campaign_id(&self) -> Option<&str> {
        self.campaign_id.as_deref().filter(|s| !s.is_empty())
    }

    /// The narrowest scope present: session, then campaign, else `None` (the type default)
    pub fn most_specific_scope(&self) -> Option<(Scope, &str)> {
        self.session_id()
            .map(|id| (Scope::Session, id))
            .or_else(|| self.campaign_id().map(|id| (Scope::Campaign, id)))
    }
}

impl std::fmt::Display for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.most_specific_scope() {
            Some((scope, id)) => write!(f, "{}:{}", scope, id),
            None => write!(f, "default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_specific_scope() {
        let both = CallContext::campaign("c1").with_session("s1");
        assert_eq!(both.most_specific_scope(), Some((Scope::Session, "s1")));
        assert_eq!(
            CallContext::campaign("c1").most_specific_scope(),
            Some((Scope::Campaign, "c1"))
        );
        assert_eq!(CallContext::new().most_specific_scope(), None);
        assert_eq!(CallContext::session("").most_specific_scope(), None);
        assert_eq!(both.to_string(), "session:s1");
    }
}
