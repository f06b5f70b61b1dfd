//! Snapshot storage backends
//!
//! Eviction never waits on these succeeding; a failed upload is logged
//! and the container is removed anyway.

use async_trait::async_trait;
use bastion_foundation::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Writes snapshots as files under a directory
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') {
            return Err(Error::Storage(format!("invalid snapshot key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl SnapshotStore for LocalDirStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

/// Keeps snapshots in memory
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("upload rejected".to_string()));
        }
        self.objects.lock().insert(key.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_dir_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirStore::new(dir.path());
        store.upload("web/bst-1.tar", b"data".to_vec()).await.unwrap();
        let written = std::fs::read(dir.path().join("web/bst-1.tar")).unwrap();
        assert_eq!(written, b"data");
        assert!(store.upload("../escape", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_failure_toggle() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.upload("a", vec![1]).await.is_err());
        store.set_failing(false);
        store.upload("a", vec![1]).await.unwrap();
        assert_eq!(store.get("a"), Some(vec![1]));
    }
}
