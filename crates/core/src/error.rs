//! Error types shared across the gateway crates

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Voice embedding error: {0}")]
    Embedding(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Personality error: {0}")]
    Personality(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias using the core [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error was caused by bad input rather than a backend failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Personality(_) | Error::Embedding(_) | Error::Config(_)
        )
    }
}
