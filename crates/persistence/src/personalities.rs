//! Personality storage
//!
//! Personalities are stored one per JSON file, named after the display name
//! and the id (`Jane_Doe_abc123.json`) so the directory is browsable. Lookups
//! go by id alone.

use crate::embeddings::EmbeddingDirectory;
use crate::PersistenceError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use voice_gateway_core::PersonalityConfig;

/// Personality store trait
#[async_trait]
pub trait PersonalityStore: Send + Sync {
    /// Look up a personality by id
    async fn resolve(&self, id: &str) -> Result<Option<PersonalityConfig>, PersistenceError>;

    /// All personalities, without their embedding payloads
    async fn list(&self) -> Result<Vec<PersonalityConfig>, PersistenceError>;

    /// Create or replace a personality
    async fn save(&self, personality: PersonalityConfig) -> Result<(), PersistenceError>;

    /// Delete a personality, returning whether it existed
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;
}

/// Ids are used in file names, so only a conservative alphabet is accepted
pub fn validate_id(id: &str) -> Result<(), PersistenceError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidId(id.to_string()))
    }
}

/// File name for a personality: `{safe_name}_{id}.json`, or `{id}.json`
/// when the name has no usable characters
pub fn personality_filename(name: &str, id: &str) -> String {
    let safe_name: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .replace(' ', "_");
    if safe_name.is_empty() {
        format!("{}.json", id)
    } else {
        format!("{}_{}.json", safe_name, id)
    }
}

/// Personalities stored as JSON files in a directory
pub struct FilePersonalityStore {
    dir: PathBuf,
    embeddings: EmbeddingDirectory,
}

impl FilePersonalityStore {
    pub fn new(dir: impl Into<PathBuf>, embeddings: EmbeddingDirectory) -> Self {
        Self {
            dir: dir.into(),
            embeddings,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Find the file for `id` regardless of its name prefix.
    ///
    /// Ids may contain `_`, so a suffix match alone is ambiguous (`x_b` also
    /// ends in `_b.json`); a candidate only counts when its stored id matches.
    async fn find_file(&self, id: &str) -> Result<Option<PathBuf>, PersistenceError> {
        let suffix = format!("_{}.json", id);
        let bare = format!("{}.json", id);
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.ends_with(&suffix) || file_name == bare {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        for path in candidates {
            match Self::read_file(&path).await {
                Ok(stored) if stored.id == id => return Ok(Some(path)),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable personality");
                }
            }
        }
        Ok(None)
    }

    async fn read_file(path: &Path) -> Result<PersonalityConfig, PersistenceError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Inline the embedding file when it changed or was never inlined
    async fn inline_embedding(
        &self,
        personality: &mut PersonalityConfig,
        previous: Option<&PersonalityConfig>,
    ) -> Result<(), PersistenceError> {
        let previous_embedding = previous.and_then(|p| p.embedding.as_deref());
        let previous_data = previous.and_then(|p| p.embedding_payload());
        let embedding_changed = personality.embedding.as_deref() != previous_embedding;

        if !embedding_changed {
            if let Some(data) = previous_data {
                personality.embedding_data = Some(data.to_string());
                return Ok(());
            }
        }

        let Some(file) = personality.embedding.as_deref().filter(|f| !f.is_empty()) else {
            return Ok(());
        };
        match self.embeddings.read(file).await? {
            Some(bytes) => {
                tracing::info!(
                    personality = %personality.id,
                    file = %file,
                    bytes = bytes.len(),
                    "Inlined embedding data"
                );
                personality.embedding_data = Some(STANDARD.encode(bytes));
            }
            None => {
                tracing::warn!(
                    personality = %personality.id,
                    file = %file,
                    "Embedding file not found, keeping personality without inline data"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PersonalityStore for FilePersonalityStore {
    async fn resolve(&self, id: &str) -> Result<Option<PersonalityConfig>, PersistenceError> {
        validate_id(id)?;
        match self.find_file(id).await? {
            Some(path) => Ok(Some(Self::read_file(&path).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<PersonalityConfig>, PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut personalities = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_file(&path).await {
                Ok(personality) => personalities.push(personality.without_embedding_data()),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to read personality");
                }
            }
        }
        Ok(personalities)
    }

    async fn save(&self, mut personality: PersonalityConfig) -> Result<(), PersistenceError> {
        validate_id(&personality.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let old_file = self.find_file(&personality.id).await?;
        let previous = match &old_file {
            Some(path) => Some(Self::read_file(path).await?),
            None => None,
        };

        self.inline_embedding(&mut personality, previous.as_ref())
            .await?;

        let file_name = personality_filename(&personality.name, &personality.id);
        let path = self.dir.join(&file_name);
        if let Some(old) = old_file.filter(|old| *old != path) {
            tokio::fs::remove_file(&old).await?;
            tracing::debug!(from = %old.display(), to = %file_name, "Renamed personality file");
        }

        let json = serde_json::to_string_pretty(&personality)?;
        tokio::fs::write(&path, json).await?;
        tracing::info!(personality = %personality.id, file = %file_name, "Saved personality");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        validate_id(id)?;
        match self.find_file(id).await? {
            Some(path) => {
                tokio::fs::remove_file(&path).await?;
                tracing::info!(personality = %id, "Deleted personality");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-memory personality store (for tests and ephemeral deployments)
#[derive(Default)]
pub struct InMemoryPersonalityStore {
    personalities: RwLock<HashMap<String, PersonalityConfig>>,
}

impl InMemoryPersonalityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the given personalities
    pub fn with_personalities(personalities: impl IntoIterator<Item = PersonalityConfig>) -> Self {
        let store = Self::new();
        {
            let mut map = store.personalities.write();
            for personality in personalities {
                map.insert(personality.id.clone(), personality);
            }
        }
        store
    }
}

#[async_trait]
impl PersonalityStore for InMemoryPersonalityStore {
    async fn resolve(&self, id: &str) -> Result<Option<PersonalityConfig>, PersistenceError> {
        Ok(self.personalities.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<PersonalityConfig>, PersistenceError> {
        let mut personalities: Vec<_> = self
            .personalities
            .read()
            .values()
            .map(PersonalityConfig::without_embedding_data)
            .collect();
        personalities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(personalities)
    }

    async fn save(&self, personality: PersonalityConfig) -> Result<(), PersistenceError> {
        validate_id(&personality.id)?;
        self.personalities
            .write()
            .insert(personality.id.clone(), personality);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        Ok(self.personalities.write().remove(id).is_some())
    }
}
