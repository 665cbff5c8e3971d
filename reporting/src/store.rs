//! Persistent endpoint/group snapshot providers.
//!
//! The store contract is a pair of collections loaded once at startup and
//! written back on dirty-set flushes. The on-disk encoding is owned by the
//! provider; the core only sees [`StoredClients`].

use crate::types::PartitionKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Errors from the persistent client store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not read stored clients: {0}")]
    Read(String),

    #[error("could not write stored clients: {0}")]
    Write(String),

    #[error("stored clients are corrupt: {0}")]
    Corrupt(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredClients {
    pub endpoint_groups: Vec<StoredEndpointGroup>,
    pub endpoints: Vec<StoredEndpoint>,
}

/// Persisted form of an origin-keyed endpoint group. Source-keyed (V1)
/// groups are document-scoped and never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEndpointGroup {
    pub origin: Url,
    pub partition: PartitionKey,
    pub group: String,
    pub include_subdomains: bool,
    pub expires_unix_ms: u64,
    pub last_used_unix_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEndpoint {
    pub origin: Url,
    pub partition: PartitionKey,
    pub group: String,
    pub url: Url,
    pub priority: u32,
    pub weight: u32,
}

#[async_trait]
pub trait ReportingStore: Send + Sync {
    /// Loads the full client snapshot. Called at most once per service.
    async fn load(&self) -> Result<StoredClients, StoreError>;

    /// Replaces the persisted snapshot.
    async fn store(&self, clients: &StoredClients) -> Result<(), StoreError>;
}

/// JSON-file-backed store. A missing file loads as an empty snapshot so
/// first runs need no provisioning.
pub struct FilesystemStore {
    path: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FilesystemStore {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ReportingStore for FilesystemStore {
    async fn load(&self) -> Result<StoredClients, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoredClients::default());
            }
            Err(e) => return Err(StoreError::Read(e.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn store(&self, clients: &StoredClients) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(clients).map_err(|e| StoreError::Write(e.to_string()))?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))
    }
}

/// No-op store for tests and store-less configurations that still exercise
/// the load path.
pub struct NoopStore;

#[async_trait]
impl ReportingStore for NoopStore {
    async fn load(&self) -> Result<StoredClients, StoreError> {
        tracing::debug!("loading clients from the no-op store");
        Ok(StoredClients::default())
    }

    async fn store(&self, _clients: &StoredClients) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_clients() -> StoredClients {
        let origin = Url::parse("https://a.test").unwrap();
        StoredClients {
            endpoint_groups: vec![StoredEndpointGroup {
                origin: origin.clone(),
                partition: PartitionKey::new("https://site.test"),
                group: "g".into(),
                include_subdomains: false,
                expires_unix_ms: 1_700_000_000_000,
                last_used_unix_ms: 1_600_000_000_000,
            }],
            endpoints: vec![StoredEndpoint {
                origin,
                partition: PartitionKey::new("https://site.test"),
                group: "g".into(),
                url: Url::parse("https://r.test/up").unwrap(),
                priority: 1,
                weight: 2,
            }],
        }
    }

    #[tokio::test]
    async fn filesystem_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("clients.json"));

        let clients = sample_clients();
        store.store(&clients).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, clients);
    }

    #[tokio::test]
    async fn filesystem_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().await.unwrap(), StoredClients::default());
    }

    #[tokio::test]
    async fn filesystem_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FilesystemStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn load_then_store_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        let store = FilesystemStore::new(&path);
        store.store(&sample_clients()).await.unwrap();
        let before = tokio::fs::read(&path).await.unwrap();

        let loaded = store.load().await.unwrap();
        store.store(&loaded).await.unwrap();
        let after = tokio::fs::read(&path).await.unwrap();
        assert_eq!(before, after);
    }
}
