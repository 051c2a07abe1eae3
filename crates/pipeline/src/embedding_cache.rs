//! Single-slot voice embedding cache
//!
//! The engine holds exactly one voice embedding. Decoding and loading one is
//! expensive, so the cache remembers which personality's embedding is
//! resident and skips the load when the same key comes back.

use crate::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use voice_gateway_core::InferenceEngine;

/// Result of [`EmbeddingCache::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingLoad {
    /// Payload decoded and loaded into the engine
    Loaded,
    /// Key was already resident; nothing was decoded
    AlreadyResident,
}

/// Tracks which embedding key is resident in the engine
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    resident: Option<String>,
    loads: u64,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the embedding currently loaded in the engine
    pub fn resident_key(&self) -> Option<&str> {
        self.resident.as_deref()
    }

    /// Number of payloads actually decoded and loaded
    pub fn load_count(&self) -> u64 {
        self.loads
    }

    /// Make `key` resident, decoding the base64 `payload` only on a miss.
    ///
    /// On failure the resident key is left untouched.
    pub fn load(
        &mut self,
        engine: &mut dyn InferenceEngine,
        key: &str,
        payload: &str,
    ) -> Result<EmbeddingLoad, PipelineError> {
        if self.resident.as_deref() == Some(key) {
            tracing::debug!(key = %key, "Voice embedding already resident");
            return Ok(EmbeddingLoad::AlreadyResident);
        }

        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| PipelineError::Embedding(format!("invalid base64 payload: {}", e)))?;

        engine
            .load_voice_embedding(&bytes)
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;

        self.resident = Some(key.to_string());
        self.loads += 1;
        tracing::info!(key = %key, bytes = bytes.len(), "Loaded voice embedding");
        Ok(EmbeddingLoad::Loaded)
    }

    /// Forget the resident key after the engine's voice state was replaced
    /// by something other than a cached embedding
    pub fn invalidate(&mut self) {
        self.resident = None;
    }
}
