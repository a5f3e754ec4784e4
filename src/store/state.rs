//! Key to blob persistence for limiter counters, run-state and snapshots.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{PacerError, Result};

/// Key under which the rate limiter persists its counters.
pub const RATE_LIMITER_KEY: &str = "rate_limiter_state";
/// Key under which the queue persists its run-state.
pub const QUEUE_STATE_KEY: &str = "queue_state";
/// Key under which [`MemoryStore`](super::MemoryStore) snapshots itself.
pub const CAMPAIGN_STORE_KEY: &str = "campaign_store";

/// A simple key to blob store, read at start and written after mutations.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// Read and decode a JSON value.
pub async fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}

/// Process-local state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// One file per key inside a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash never leaves a half-written blob behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Open (and create if needed) the state directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(PacerError::StoreUnavailable(format!("invalid state key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PacerError::StoreUnavailable(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        trace!(path = %path.display(), bytes = value.len(), "Persisting state");

        let write = async {
            tokio::fs::write(&tmp, &value).await?;
            tokio::fs::rename(&tmp, &path).await
        };
        write.await.map_err(|e| {
            PacerError::StoreUnavailable(format!("writing {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(store.get("missing").await.unwrap().is_none());

        save_json(&store, "k", &Sample { count: 7 }).await.unwrap();
        let loaded: Option<Sample> = load_json(&store, "k").await.unwrap();
        assert_eq!(loaded, Some(Sample { count: 7 }));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::open(dir.path()).await.unwrap();
            save_json(&store, QUEUE_STATE_KEY, &Sample { count: 3 }).await.unwrap();
            save_json(&store, QUEUE_STATE_KEY, &Sample { count: 4 }).await.unwrap();
        }

        let store = FileStateStore::open(dir.path()).await.unwrap();
        let loaded: Option<Sample> = load_json(&store, QUEUE_STATE_KEY).await.unwrap();
        assert_eq!(loaded, Some(Sample { count: 4 }));
        assert!(!dir.path().join("queue_state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let err = store.set("../escape", Vec::new()).await.unwrap_err();
        assert!(matches!(err, PacerError::StoreUnavailable(_)));
    }
}
