// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Filesystem-backed blob storage, grounded on `LocalStorage`: every key is
//! resolved and canonicalized against `base_dir` before any I/O, rejecting
//! anything that would escape it.

use async_trait::async_trait;
use sandcastle_core::blob_store::BlobStorage;
use std::path::{Path, PathBuf};

pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    pub async fn new(base_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        let base_dir = tokio::fs::canonicalize(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn safe_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let joined = self.base_dir.join(key);
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.base_dir) {
            anyhow::bail!("path traversal denied: {key}");
        }
        Ok(normalized)
    }
}

/// Lexically normalizes `.`/`..` components without touching the
/// filesystem, since the target path may not exist yet (e.g. on write).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl BlobStorage for LocalStorage {
    async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.safe_path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, content: &str) -> anyhow::Result<()> {
        let path = self.safe_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let target = self.safe_path(prefix)?;
        let search_dir = if target.is_dir() { target.clone() } else { target.parent().map(Path::to_path_buf).unwrap_or_else(|| self.base_dir.clone()) };
        if !search_dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut stack = vec![search_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.base_dir) {
                    let rel = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                    if rel.starts_with(prefix) {
                        results.push(rel);
                    }
                }
            }
        }
        results.sort();
        Ok(results)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.safe_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_written_key() {
        let dir = tempdir();
        let store = LocalStorage::new(&dir).await.unwrap();
        store.write("runs/a.json", "hello").await.unwrap();
        assert_eq!(store.read("runs/a.json").await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let dir = tempdir();
        let store = LocalStorage::new(&dir).await.unwrap();
        assert_eq!(store.read("missing.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempdir();
        let store = LocalStorage::new(&dir).await.unwrap();
        let err = store.write("../../etc/passwd", "pwned").await.unwrap_err();
        assert!(err.to_string().contains("path traversal"));
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = tempdir();
        let store = LocalStorage::new(&dir).await.unwrap();
        store.write("runs/a.json", "1").await.unwrap();
        store.write("runs/b.json", "2").await.unwrap();
        store.write("other/c.json", "3").await.unwrap();
        let listed = store.list("runs/").await.unwrap();
        assert_eq!(listed, vec!["runs/a.json".to_string(), "runs/b.json".to_string()]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir();
        let store = LocalStorage::new(&dir).await.unwrap();
        store.write("a.json", "1").await.unwrap();
        store.delete("a.json").await.unwrap();
        store.delete("a.json").await.unwrap();
        assert_eq!(store.read("a.json").await.unwrap(), None);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("sandcastle-storage-test-{:?}", std::thread::current().id()));
        dir
    }
}
