//! Voice embedding files

use crate::PersistenceError;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Listing entry for an embedding file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingFile {
    /// Name without extension
    pub name: String,
    /// File name inside the embeddings directory
    pub file: String,
    pub size_bytes: u64,
}

/// Directory of voice embedding files
#[derive(Debug, Clone)]
pub struct EmbeddingDirectory {
    dir: PathBuf,
    extension: String,
}

impl EmbeddingDirectory {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// File name for an embedding called `name`
    pub fn file_name_for(&self, name: &str) -> String {
        format!("{}{}", name, self.extension)
    }

    /// File name for `name`, rejecting names that would escape the directory
    pub fn checked_file_name(&self, name: &str) -> Result<String, PersistenceError> {
        let file = self.file_name_for(name);
        validate_file_name(&file)?;
        Ok(file)
    }

    /// Embedding files sorted by name
    pub async fn list(&self) -> Result<Vec<EmbeddingFile>, PersistenceError> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file.strip_suffix(self.extension.as_str()) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(EmbeddingFile {
                name: name.to_string(),
                file: file.clone(),
                size_bytes: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Read an embedding file by its file name; `None` if it does not exist
    pub async fn read(&self, file: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        validate_file_name(file)?;
        match tokio::fs::read(self.dir.join(file)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write an embedding called `name`, returning its file name
    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<String, PersistenceError> {
        let file = self.checked_file_name(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(&file), bytes).await?;
        tracing::info!(file = %file, bytes = bytes.len(), "Wrote voice embedding");
        Ok(file)
    }
}

/// Reject names that could escape the directory
pub(crate) fn validate_file_name(name: &str) -> Result<(), PersistenceError> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\');
    if invalid {
        return Err(PersistenceError::InvalidFileName(name.to_string()));
    }
    Ok(())
}
