//! switchyard-config - live provider-selection configuration
//!
//! This crate provides:
//! - The configuration model (provider mapping per adapter type, connection settings per provider)
//! - Boundary validation of configuration documents
//! - The [`ConfigWatcher`] contract with file-backed and in-memory implementations

pub mod error;
pub mod file;
pub mod memory;
pub mod model;
pub mod watcher;

pub use error::ConfigError;
pub use file::{FileConfigWatcher, FileWatcherOptions, load_config_file, write_config_file};
pub use memory::MemoryConfigWatcher;
pub use model::{
    ConnectionSettings, ProviderMapping, ProviderType, RegistryConfig, Scope, default_config,
    validate_document,
};
pub use watcher::{ConfigEvent, ConfigState, ConfigWatcher};
