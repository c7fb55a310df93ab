// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
}

/// Persistence for conversation-scoped artifacts that live alongside the
/// event log but aren't events themselves — condenser checkpoints, uploaded
/// attachments, exported transcripts.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), FileStoreError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, FileStoreError>;
    async fn delete(&self, path: &str) -> Result<(), FileStoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, FileStoreError>;
}

/// In-memory store for tests and ephemeral (non-persisted) conversations.
#[derive(Default)]
pub struct MemoryFileStore {
    files: tokio::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), FileStoreError> {
        self.files.lock().await.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| FileStoreError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        self.files.lock().await.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, FileStoreError> {
        Ok(self.files.lock().await.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

/// Disk-backed store rooted at a base directory. Paths are joined under the
/// root and never allowed to escape it via `..`.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let candidate = Path::new(path);
        if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(FileStoreError::NotFound(path.to_string()));
        }
        Ok(self.root.join(candidate))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), FileStoreError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FileStoreError::Io { path: path.to_string(), source: e })?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| FileStoreError::Io { path: path.to_string(), source: e })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FileStoreError::NotFound(path.to_string())
            } else {
                FileStoreError::Io { path: path.to_string(), source: e }
            }
        })
    }

    async fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileStoreError::Io { path: path.to_string(), source: e }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, FileStoreError> {
        let dir = self.resolve(prefix)?;
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(FileStoreError::Io { path: prefix.to_string(), source: e }),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FileStoreError::Io { path: prefix.to_string(), source: e })?
        {
            if let Some(name) = entry.file_name().to_str() {
                out.push(format!("{prefix}/{name}"));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_write_then_read_round_trips() {
        let store = MemoryFileStore::new();
        store.write("a/b.json", b"{}").await.unwrap();
        assert_eq!(store.read("a/b.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn memory_store_read_missing_is_not_found() {
        let store = MemoryFileStore::new();
        assert!(matches!(store.read("nope").await, Err(FileStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn local_store_rejects_parent_dir_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(tmp.path());
        let err = store.write("../escape.txt", b"x").await.unwrap_err();
        assert!(matches!(err, FileStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_store_write_read_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(tmp.path());
        store.write("notes/x.txt", b"hello").await.unwrap();
        assert_eq!(store.read("notes/x.txt").await.unwrap(), b"hello");
        store.delete("notes/x.txt").await.unwrap();
        assert!(matches!(store.read("notes/x.txt").await, Err(FileStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn local_store_list_returns_prefixed_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(tmp.path());
        store.write("notes/a.txt", b"1").await.unwrap();
        store.write("notes/b.txt", b"2").await.unwrap();
        let mut listed = store.list("notes").await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["notes/a.txt", "notes/b.txt"]);
    }
}
