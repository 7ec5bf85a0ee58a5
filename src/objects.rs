//! Raw upload storage.
//!
//! Uploaded bytes are kept outside the database under a path of the form
//! `{owner_id}/{document_id}/{filename}`. [`FsObjectStore`] writes them
//! below a root directory; [`MemoryObjectStore`] keeps them in a map.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    /// Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Storage path for an upload. The filename is reduced to its final
/// component so it cannot escape the owner's prefix.
pub fn object_path(owner_id: &str, document_id: &str, filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    format!("{}/{}/{}", owner_id, document_id, name)
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object path: {}", path);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .with_context(|| format!("Failed to write object {}", full.display()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read object {}", full.display()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().unwrap().contains_key(path)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .write()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().unwrap().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_strips_directories() {
        assert_eq!(object_path("u1", "d1", "../../etc/passwd"), "u1/d1/passwd");
        assert_eq!(object_path("u1", "d1", "report.pdf"), "u1/d1/report.pdf");
    }

    #[tokio::test]
    async fn test_fs_roundtrip_and_delete() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());
        store.put("u1/d1/a.txt", b"hello").await.unwrap();
        assert_eq!(store.get("u1/d1/a.txt").await.unwrap(), b"hello");
        store.delete("u1/d1/a.txt").await.unwrap();
        assert!(store.get("u1/d1/a.txt").await.is_err());
        store.delete("u1/d1/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_rejects_traversal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsObjectStore::new(tmp.path());
        assert!(store.put("../escape.txt", b"x").await.is_err());
    }
}
