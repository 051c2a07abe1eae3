//! Persistence errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl PersistenceError {
    /// Whether the caller supplied bad input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PersistenceError::InvalidId(_)
                | PersistenceError::InvalidFileName(_)
                | PersistenceError::NotFound(_)
        )
    }
}

impl From<PersistenceError> for voice_gateway_core::Error {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Io(e) => voice_gateway_core::Error::Io(e),
            PersistenceError::Serialization(e) => voice_gateway_core::Error::Serialization(e),
            other => voice_gateway_core::Error::Personality(other.to_string()),
        }
    }
}
