use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use tracing::debug;

/// Key-value blob storage scoped by container (one bucket per knowledge base).
pub trait BlobStore: Send + Sync {
    fn put(&self, container: &str, key: &str, bytes: &[u8]) -> Result<()>;
    fn exists(&self, container: &str, key: &str) -> Result<bool>;
    fn get(&self, container: &str, key: &str) -> Result<Vec<u8>>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, container: &str, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert((container.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, container: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .read()
            .contains_key(&(container.to_string(), key.to_string())))
    }

    fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("blob {container}/{key} not found"))
    }
}

/// Stores each container as a directory under `root`.
#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create blob root {}", root.display()))?;
        Ok(Self { root })
    }

    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf> {
        for part in [container, key] {
            let traversal = part == "." || part == ".." || part.contains('/') || part.contains('\\');
            if part.is_empty() || traversal {
                return Err(anyhow!("invalid blob path component {part:?}"));
            }
        }
        Ok(self.root.join(container).join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, container: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(container, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        debug!(container, key, bytes = bytes.len(), "blob written");
        Ok(())
    }

    fn exists(&self, container: &str, key: &str) -> Result<bool> {
        Ok(self.object_path(container, key)?.is_file())
    }

    fn get(&self, container: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(container, key)?;
        fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_scopes_by_container() {
        let store = MemoryBlobStore::new();
        store.put("kb1", "a.txt", b"one").unwrap();
        assert!(store.exists("kb1", "a.txt").unwrap());
        assert!(!store.exists("kb2", "a.txt").unwrap());
        assert_eq!(store.get("kb1", "a.txt").unwrap(), b"one");
        assert!(store.get("kb2", "a.txt").is_err());
    }

    #[test]
    fn fs_store_writes_under_container_dir() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        store.put("kb1", "img-1", &[9, 8, 7]).unwrap();
        assert!(dir.path().join("kb1/img-1").exists());
        assert_eq!(store.get("kb1", "img-1").unwrap(), vec![9, 8, 7]);
        assert!(!store.exists("kb1", "missing").unwrap());
    }

    #[test]
    fn fs_store_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        assert!(store.put("..", "x", b"").is_err());
        assert!(store.put("kb", "../x", b"").is_err());
    }
}
