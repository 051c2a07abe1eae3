//! File-backed storage for the voice gateway
//!
//! Provides persistent storage for:
//! - Personalities (one JSON file each)
//! - Model weight paths (`settings.json`)
//! - Voice embedding files

pub mod embeddings;
pub mod error;
pub mod model_settings;
pub mod personalities;

pub use embeddings::{EmbeddingDirectory, EmbeddingFile};
pub use error::PersistenceError;
pub use model_settings::ModelSettingsStore;
pub use personalities::{
    personality_filename, validate_id, FilePersonalityStore, InMemoryPersonalityStore,
    PersonalityStore,
};
