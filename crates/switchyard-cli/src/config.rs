use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_config::FileWatcherOptions;
use switchyard_core::BatchOptions;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub providers: ProvidersFileConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersFileConfig {
    /// Watched provider-selection document (JSON)
    #[serde(default = "default_providers_path")]
    pub path: String,
}

fn default_providers_path() -> String {
    "~/.switchyard/providers.json".to_string()
}

impl Default for ProvidersFileConfig {
    fn default() -> Self {
        Self {
            path: default_providers_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
    /// Consulted by the env store when a variable is unset
    #[serde(default)]
    pub fallback_file: Option<String>,
    #[serde(default = "default_secrets_file")]
    pub secrets_file: String,
}

fn default_env_prefix() -> String {
    switchyard_core::secrets::env::DEFAULT_ENV_PREFIX.to_string()
}

fn default_secrets_file() -> String {
    "~/.switchyard/secrets.json".to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
            fallback_file: None,
            secrets_file: default_secrets_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// 0 disables polling
    #[serde(default)]
    pub poll_secs: u64,
}

fn default_debounce_ms() -> u64 {
    250
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_secs: 0,
        }
    }
}

impl WatcherConfig {
    pub fn options(&self) -> FileWatcherOptions {
        FileWatcherOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            poll_interval: (self.poll_secs > 0).then(|| Duration::from_secs(self.poll_secs)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_db")]
    pub database_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_true")]
    pub log_errors: bool,
}

fn default_metrics_db() -> String {
    "~/.switchyard/metrics.db".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_max_pending() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            database_path: default_metrics_db(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_pending: default_max_pending(),
            log_errors: true,
        }
    }
}

impl MetricsConfig {
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_pending: self.max_pending,
            log_errors: self.log_errors,
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

impl SwitchyardConfig {
    /// Load the app config; a missing default file yields the defaults
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        if custom_path.is_none() && !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `switchyard init` first.",
                path.display()
            )
        })?;

        // Expand environment variables before parsing
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn providers_path(&self) -> PathBuf {
        shellexpand(&self.providers.path)
    }

    pub fn secrets_path(&self) -> PathBuf {
        shellexpand(&self.secrets.secrets_file)
    }

    pub fn fallback_secrets_path(&self) -> Option<PathBuf> {
        self.secrets.fallback_file.as_deref().map(shellexpand)
    }

    pub fn metrics_db_path(&self) -> PathBuf {
        shellexpand(&self.metrics.database_path)
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// `SWITCHYARD_*` variables are always allowed.
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER"];

fn is_allowed_env_var(name: &str) -> bool {
    ALLOWED_ENV_VARS.contains(&name) || name.starts_with("SWITCHYARD_")
}

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !is_allowed_env_var(&var_name) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len; // Skip past the expanded value
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn shellexpand(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
