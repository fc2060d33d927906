//! Error normalization
//!
//! Adapters fail in many shapes: typed [`ProviderFailure`]s, `reqwest` errors,
//! or plain `anyhow` messages. [`normalize`] folds them into a
//! [`ClassifiedError`] whose [`ErrorKind`] drives retry policy.
//!
//! Classification order, first match wins:
//! 1. an error that is already a [`ClassifiedError`] passes through
//! 2. an HTTP status, mapped through a fixed table
//! 3. message patterns specific to the provider
//! 4. generic message vocabularies
//! 5. [`ErrorKind::Unknown`]

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Upper bound for [`retry_delay`]
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Replacement written by [`redact`]
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEY_PARTS: [&str; 6] = ["key", "token", "secret", "password", "auth", "credential"];

/// Closed taxonomy of provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Unavailable,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure folded into the closed taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Rendered cause chain of the original error
    pub cause: String,
}

impl ClassifiedError {
    pub fn is_retryable(&self) -> bool {
        is_retryable(self.kind)
    }
}

/// Typed failure adapters raise when they have more than a message
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderFailure {
    pub status: Option<u16>,
    /// Provider error code, e.g. `rate_limit_exceeded`
    pub code: Option<String>,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Observability fields appended to the classified message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    fn annotation(&self) -> Option<String> {
        let parts: Vec<String> = [
            ("operation", &self.operation),
            ("model", &self.model),
            ("request_id", &self.request_id),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_ref().map(|v| format!("{}={}", label, v)))
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

type Rules = Vec<(Regex, ErrorKind)>;

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?i){}", pattern))
}

/// Compile a table; a pattern that fails to compile is logged and skipped
fn rules(patterns: &[(&str, ErrorKind)]) -> Rules {
    patterns
        .iter()
        .filter_map(|(pattern, kind)| match compile(pattern) {
            Ok(re) => Some((re, *kind)),
            Err(e) => {
                warn!("Skipping invalid classification pattern '{}': {}", pattern, e);
                None
            }
        })
        .collect()
}

static STATUS_IN_MESSAGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:status|http)(?:\s+code)?[\s:=]*([1-5]\d{2})\b").ok());

type Patterns = Vec<(&'static str, ErrorKind)>;

fn provider_patterns() -> Vec<(Vec<&'static str>, Patterns)> {
    use ErrorKind::*;
    vec![
        (
            vec!["openai"],
            vec![
                (r"insufficient_quota|rate_limit_exceeded|requests per min", RateLimit),
                (r"invalid_api_key|incorrect api key|invalid_organization", Auth),
                (r"context_length_exceeded|maximum context length", Validation),
                (r"content_policy_violation|content_filter", Validation),
                (r"engine is currently overloaded|server_error", Unavailable),
            ],
        ),
        (
            vec!["anthropic", "claude"],
            vec![
                (r"overloaded_error", Unavailable),
                (r"rate_limit_error", RateLimit),
                (r"authentication_error|permission_error|x-api-key", Auth),
                (r"prompt is too long|invalid_request_error", Validation),
                (r"api_error", Unavailable),
            ],
        ),
        (
            vec!["ollama"],
            vec![
                (r"connection refused|is ollama running|error sending request", Unavailable),
                (r"model '?[\w.:/-]+'? not found|try pulling", Validation),
                (r"out of memory|model requires more system memory", Unavailable),
                (r"context deadline exceeded", Timeout),
            ],
        ),
        (
            vec!["elevenlabs"],
            vec![
                (r"quota_exceeded|character limit|too_many_concurrent_requests", RateLimit),
                (r"invalid_api_key|missing_permissions|unauthorized", Auth),
                (r"voice_not_found|voice .* (?:not found|does not exist)", Validation),
                (r"system_busy", Unavailable),
            ],
        ),
        (
            vec!["gemini", "google"],
            vec![
                (r"resource_exhausted", RateLimit),
                (r"permission_denied|unauthenticated|api key not valid", Auth),
                (r"deadline_exceeded", Timeout),
                (r"finish_reason.{0,4}safety|blocked.{0,20}safety|invalid_argument", Validation),
                (r"\bunavailable\b|\binternal\b", Unavailable),
            ],
        ),
    ]
}

fn generic_patterns() -> Patterns {
    use ErrorKind::*;
    vec![
        (r"rate.?limit|too many requests|quota exceeded|throttl", RateLimit),
        (r"unauthori[sz]ed|forbidden|invalid api.?key|authentication|access denied", Auth),
        (r"timed? ?out|timeout|deadline exceeded|etimedout", Timeout),
        (
            r"unavailable|overloaded|bad gateway|internal server error|econnrefused|econnreset|connection (?:refused|reset|closed)|try again later",
            Unavailable,
        ),
        (r"content.?policy|safety system|flagged|moderation", Validation),
        (r"context.?length|too long|max(?:imum)?.?tokens|token limit", Validation),
        (r"invalid|bad request|malformed|unprocessable|missing required|validation", Validation),
    ]
}

static PROVIDER_RULES: LazyLock<Vec<(Vec<&'static str>, Rules)>> = LazyLock::new(|| {
    provider_patterns()
        .into_iter()
        .map(|(families, patterns)| (families, rules(&patterns)))
        .collect()
});

static GENERIC_RULES: LazyLock<Rules> = LazyLock::new(|| rules(&generic_patterns()));

/// Fixed HTTP status table, including provider-specific codes
pub fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::Auth),
        429 => Some(ErrorKind::RateLimit),
        408 | 504 | 598 | 599 => Some(ErrorKind::Timeout),
        500 | 502 | 503 | 529 | 520..=524 => Some(ErrorKind::Unavailable),
        400 | 409 | 422 => Some(ErrorKind::Validation),
        _ => None,
    }
}

/// Classify an error
pub fn normalize(
    err: &anyhow::Error,
    provider_id: Option<&str>,
    context: Option<&ErrorContext>,
) -> ClassifiedError {
    if let Some(classified) = err.chain().find_map(|e| e.downcast_ref::<ClassifiedError>()) {
        return classified.clone();
    }

    let cause = format!("{:#}", err);
    let http_status = find_status(err, &cause);
    let code = err
        .chain()
        .find_map(|e| e.downcast_ref::<ProviderFailure>())
        .and_then(|f| f.code.clone());
    let haystack = match &code {
        Some(code) => format!("{} {}", code, cause),
        None => cause.clone(),
    };

    let kind = http_status
        .and_then(kind_for_status)
        .or_else(|| provider_id.and_then(|id| match_provider(id, &haystack)))
        .or_else(|| first_match(&GENERIC_RULES, &haystack))
        .unwrap_or(ErrorKind::Unknown);

    let mut message = err.to_string();
    if let Some(annotation) = context.and_then(ErrorContext::annotation) {
        message = format!("{} ({})", message, annotation);
    }

    ClassifiedError {
        kind,
        message,
        provider_id: provider_id.map(|s| s.to_string()),
        http_status,
        cause,
    }
}

fn find_status(err: &anyhow::Error, rendered: &str) -> Option<u16> {
    err.chain()
        .find_map(|e| {
            if let Some(failure) = e.downcast_ref::<ProviderFailure>() {
                return failure.status;
            }
            e.downcast_ref::<reqwest::Error>()
                .and_then(reqwest::Error::status)
                .map(|s| s.as_u16())
        })
        .or_else(|| {
            STATUS_IN_MESSAGE
                .as_ref()
                .and_then(|re| re.captures(rendered))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
}

fn match_provider(provider_id: &str, haystack: &str) -> Option<ErrorKind> {
    let id = provider_id.to_lowercase();
    PROVIDER_RULES
        .iter()
        .find(|(families, _)| families.iter().any(|f| id.contains(f)))
        .and_then(|(_, rules)| first_match(rules, haystack))
}

fn first_match(rules: &Rules, haystack: &str) -> Option<ErrorKind> {
    rules
        .iter()
        .find(|(re, _)| re.is_match(haystack))
        .map(|(_, kind)| *kind)
}

/// Whether a failure of this kind is worth retrying
pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Unavailable
    )
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at [`MAX_RETRY_DELAY`].
/// Attempts are 1-based; attempt 0 is treated as 1.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// Copy of `value` with credential-like keys replaced by [`REDACTED`].
///
/// Recurses into objects and arrays of objects; primitive array items are kept.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part))
}
