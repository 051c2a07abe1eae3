//! Configuration management for the voice gateway
//!
//! Supports loading configuration from:
//! - YAML/TOML files (`config/default.*`, then `config/{env}.*`)
//! - Environment variables (`VOICE_GATEWAY__SECTION__KEY`)
//!
//! Every section has defaults, so an empty configuration is a valid
//! development setup.

pub mod settings;

pub use settings::{
    load_settings, load_settings_from, CodecConfig, EngineConfig, ObservabilityConfig,
    PreviewConfig, PrimingConfig, RuntimeEnvironment, ServerConfig, SessionConfig, Settings,
    StorageConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
