use std::path::PathBuf;

use anyhow::{Context, Result};

/// Filesystem-backed object store for uploaded files, materials and exports.
/// Object names may contain slashes; they map to subdirectories.
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, object_name: &str) -> PathBuf {
        // Reject traversal segments; object names are server-generated but
        // the download route takes them from the URL.
        let safe: PathBuf = object_name
            .split('/')
            .filter(|part| !part.is_empty() && *part != "..")
            .collect();
        self.root.join(safe)
    }

    pub async fn put(&self, object_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(object_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to store object: {object_name}"))?;
        Ok(())
    }

    pub async fn get(&self, object_name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(object_name);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read object: {object_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_nested_object_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf());

        store.put("tenders/3/file.txt", b"hello").await.unwrap();
        let bytes = store.get("tenders/3/file.txt").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn traversal_segments_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf());

        store.put("../escape.txt", b"x").await.unwrap();
        assert!(dir.path().join("escape.txt").exists());
    }
}
