//! Shared fixtures for the crate's tests.

use crate::config::ReportingPolicy;
use crate::service::{PermissiveDelegate, ReportingContext};
use crate::store::{ReportingStore, StoreError, StoredClients};
use crate::types::PartitionKey;
use crate::uploader::{UploadOutcome, Uploader};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub(crate) fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

/// Lets spawned tasks and completion handling drain without advancing time.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn test_context(
    policy: ReportingPolicy,
    uploader: Arc<MockUploader>,
) -> Arc<ReportingContext> {
    Arc::new(ReportingContext::new(
        policy,
        uploader,
        None,
        Arc::new(PermissiveDelegate),
    ))
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedUpload {
    pub endpoint: Url,
    pub payload: serde_json::Value,
    pub partition: PartitionKey,
}

/// Records every upload as it is issued and answers from a programmable
/// outcome queue, `Success` once the queue runs dry.
pub(crate) struct MockUploader {
    delay: Duration,
    outcomes: Mutex<VecDeque<UploadOutcome>>,
    uploads: Mutex<Vec<RecordedUpload>>,
}

impl MockUploader {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(MockUploader {
            delay,
            outcomes: Mutex::new(VecDeque::new()),
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn push_outcome(&self, outcome: UploadOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    pub(crate) fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(
        &self,
        endpoint: Url,
        payload: Bytes,
        partition: &PartitionKey,
    ) -> UploadOutcome {
        self.uploads.lock().push(RecordedUpload {
            endpoint,
            payload: serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null),
            partition: partition.clone(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcomes.lock().pop_front().unwrap_or(UploadOutcome::Success)
    }
}

/// In-memory store with a configurable load delay, for exercising the
/// service backlog.
pub(crate) struct MockStore {
    load_delay: Duration,
    clients: StoredClients,
    written: Mutex<Vec<StoredClients>>,
}

impl MockStore {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_load_delay(Duration::ZERO)
    }

    pub(crate) fn with_load_delay(load_delay: Duration) -> Arc<Self> {
        Arc::new(MockStore {
            load_delay,
            clients: StoredClients::default(),
            written: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn with_clients(load_delay: Duration, clients: StoredClients) -> Arc<Self> {
        Arc::new(MockStore {
            load_delay,
            clients,
            written: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn written(&self) -> Vec<StoredClients> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl ReportingStore for MockStore {
    async fn load(&self) -> Result<StoredClients, StoreError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        Ok(self.clients.clone())
    }

    async fn store(&self, clients: &StoredClients) -> Result<(), StoreError> {
        self.written.lock().push(clients.clone());
        Ok(())
    }
}
