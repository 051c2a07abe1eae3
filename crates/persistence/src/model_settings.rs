//! Persisted model weight paths

use crate::PersistenceError;
use std::path::{Path, PathBuf};
use voice_gateway_core::WeightPaths;

const SETTINGS_FILE: &str = "settings.json";

/// Reads and writes `settings.json` holding the last-used weight paths
#[derive(Debug, Clone)]
pub struct ModelSettingsStore {
    file: PathBuf,
}

impl ModelSettingsStore {
    /// Store backed by `{dir}/settings.json`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            file: dir.as_ref().join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Saved paths; empty paths when nothing usable is stored
    pub async fn load(&self) -> WeightPaths {
        let text = match tokio::fs::read_to_string(&self.file).await {
            Ok(text) => text,
            Err(_) => return WeightPaths::default(),
        };
        match serde_json::from_str(&text) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(file = %self.file.display(), error = %e, "Ignoring unreadable settings file");
                WeightPaths::default()
            }
        }
    }

    /// Clean and persist the paths, returning what was written
    pub async fn save(&self, paths: &WeightPaths) -> Result<WeightPaths, PersistenceError> {
        let cleaned = paths.cleaned();
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&cleaned)?;
        tokio::fs::write(&self.file, json).await?;
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_empty_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelSettingsStore::new(dir.path());
        assert_eq!(store.load().await, WeightPaths::default());
    }

    #[tokio::test]
    async fn test_save_cleans_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelSettingsStore::new(dir.path().join("Settings"));

        let saved = store
            .save(&WeightPaths::new(" \"/m/lm.bin\" ", "'/m/codec.bin'", "/m/tok.json"))
            .await
            .unwrap();
        assert_eq!(saved.lm_weights_path, "/m/lm.bin");

        let loaded = store.load().await;
        assert_eq!(loaded, saved);
        assert_eq!(loaded.codec_weights_path, "/m/codec.bin");
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty_paths() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(SETTINGS_FILE), "{not json")
            .await
            .unwrap();
        let store = ModelSettingsStore::new(dir.path());
        assert_eq!(store.load().await, WeightPaths::default());
    }
}
