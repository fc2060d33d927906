//! Telemetry record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a call was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    #[default]
    Single,
    PercentageSplit,
    PairedEval,
}

impl CallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::PercentageSplit => "percentage_split",
            Self::PairedEval => "paired_eval",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "percentage_split" => Self::PercentageSplit,
            "paired_eval" => Self::PairedEval,
            _ => Self::Single,
        }
    }
}

impl std::fmt::Display for CallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One normalized provider call, ready to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub request_id: String,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    #[serde(default)]
    pub mode: CallMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Classified error kind when the call failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(request_id: impl Into<String>, provider_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            provider_id: provider_id.into(),
            provider_type: None,
            model: None,
            latency_ms,
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            bytes_in: None,
            bytes_out: None,
            mode: CallMode::Single,
            paired_group_id: None,
            campaign_id: None,
            session_id: None,
            user_id: None,
            error_kind: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }
}

/// A persisted record with its generated id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCallRecord {
    pub id: String,
    #[serde(flatten)]
    pub record: CallRecord,
}

/// Summed token counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

/// Per-provider aggregate over all stored records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider_id: String,
    pub calls: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}
