//! Upload transport for report batches.

use crate::metrics_defs::UPLOAD_DURATION;
use crate::types::PartitionKey;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use url::Url;

pub const REPORT_CONTENT_TYPE: &str = "application/reports+json";

/// What the delivery agent should do with the batch after an upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Delivered; remove the reports.
    Success,
    /// The collector said 410 Gone; drop the endpoint and requeue.
    RemoveEndpoint,
    /// Transport or server failure; retry with backoff.
    Failure,
}

impl UploadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Success => "success",
            UploadOutcome::RemoveEndpoint => "remove_endpoint",
            UploadOutcome::Failure => "failure",
        }
    }
}

/// POSTs a serialized report batch to a collector URL.
///
/// The payload is a byte buffer owned by the uploader for the duration of
/// the request; report ownership stays with the cache.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        endpoint: Url,
        payload: bytes::Bytes,
        partition: &PartitionKey,
    ) -> UploadOutcome;
}

/// HTTP uploader. Presents no credentials beyond what the partition key
/// implies; uploads carry `Content-Type: application/reports+json`.
pub struct HttpUploader {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUploader {
    pub fn new(timeout_secs: u64) -> Self {
        HttpUploader {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        endpoint: Url,
        payload: bytes::Bytes,
        _partition: &PartitionKey,
    ) -> UploadOutcome {
        let start = Instant::now();
        let result = self
            .client
            .post(endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, REPORT_CONTENT_TYPE)
            .body(payload)
            .timeout(self.timeout)
            .send()
            .await;
        metrics::histogram!(UPLOAD_DURATION.name).record(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(endpoint = %endpoint, error = %e, "upload failed");
                return UploadOutcome::Failure;
            }
        };

        match response.status() {
            status if status.is_success() => UploadOutcome::Success,
            StatusCode::GONE => UploadOutcome::RemoveEndpoint,
            status => {
                tracing::debug!(endpoint = %endpoint, %status, "collector rejected upload");
                UploadOutcome::Failure
            }
        }
    }
}
