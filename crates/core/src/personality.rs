//! Personality configuration
//!
//! A personality bundles the system prompt, an optional inline voice
//! embedding and the sampling parameters a session is primed with. It is
//! stored as camelCase JSON; fields this crate does not know about are kept
//! so that saving a personality never drops client data.

use crate::traits::SamplingConfig;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Marker wrapped around system prompts
pub const SYSTEM_TAG: &str = "<system>";

/// Personality loaded from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// System prompt text
    #[serde(default)]
    pub description: String,
    /// Appended to the system prompt tokens without tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_text: Option<String>,
    /// File name of the embedding this personality was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<String>,
    /// Base64-encoded voice embedding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_data: Option<String>,
    #[serde(default = "default_text_temperature")]
    pub text_temperature: f32,
    #[serde(default = "default_text_topk")]
    pub text_topk: i64,
    #[serde(default = "default_audio_temperature")]
    pub audio_temperature: f32,
    #[serde(default = "default_audio_topk")]
    pub audio_topk: i64,
    /// -1 or absent means no seed override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_text_temperature() -> f32 {
    0.7
}

fn default_text_topk() -> i64 {
    25
}

fn default_audio_temperature() -> f32 {
    0.8
}

fn default_audio_topk() -> i64 {
    250
}

/// System prompt split into the tagged part and the untagged suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptText {
    pub system: String,
    pub additional: Option<String>,
}

impl PersonalityConfig {
    /// Minimal personality with default sampling
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            additional_text: None,
            embedding: None,
            embedding_data: None,
            text_temperature: default_text_temperature(),
            text_topk: default_text_topk(),
            audio_temperature: default_audio_temperature(),
            audio_topk: default_audio_topk(),
            seed: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_embedding_data(mut self, data: impl Into<String>) -> Self {
        self.embedding_data = Some(data.into());
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig::new(
            self.text_temperature,
            self.text_topk.max(1) as usize,
            self.audio_temperature,
            self.audio_topk.max(1) as usize,
        )
    }

    /// Seed to apply before priming; negative values mean no override
    pub fn seed_override(&self) -> Option<u64> {
        self.seed.filter(|seed| *seed >= 0).map(|seed| seed as u64)
    }

    /// Prompt text, or `None` when the description is empty
    pub fn prompt_text(&self) -> Option<PromptText> {
        if self.description.trim().is_empty() {
            return None;
        }
        let additional = self
            .additional_text
            .as_ref()
            .filter(|text| !text.is_empty())
            .cloned();
        Some(PromptText {
            system: wrap_with_system_tags(&self.description),
            additional,
        })
    }

    /// Inline embedding payload, if any
    pub fn embedding_payload(&self) -> Option<&str> {
        self.embedding_data.as_deref().filter(|data| !data.is_empty())
    }

    /// Embedding cache key; changes whenever the inline payload changes
    pub fn cache_key(&self) -> String {
        embedding_cache_key(&self.id, self.embedding_payload().unwrap_or_default())
    }

    /// Copy without the embedding payload, for listings
    pub fn without_embedding_data(&self) -> Self {
        let mut stripped = self.clone();
        stripped.embedding_data = None;
        stripped
    }
}

/// Embedding cache key for a personality id and its embedding payload
pub fn embedding_cache_key(personality_id: &str, payload: &str) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("personality:{}:{:016x}", personality_id, hasher.finish())
}

/// Surround `text` with system tags unless it already starts and ends with one
pub fn wrap_with_system_tags(text: &str) -> String {
    let cleaned = text.trim();
    if cleaned.starts_with(SYSTEM_TAG) && cleaned.ends_with(SYSTEM_TAG) {
        return cleaned.to_string();
    }
    format!("{} {} {}", SYSTEM_TAG, cleaned, SYSTEM_TAG)
}
