//! Configuration errors

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ProviderType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unsupported adapter type '{0}'")]
    UnknownProviderType(String),

    #[error("adapter type '{0}' must declare a non-empty default provider")]
    MissingDefault(ProviderType),

    #[error("failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}
