//! In-process reporting core: ingests web-origin error and telemetry
//! reports, ingests per-origin endpoint-configuration headers, persists the
//! endpoint configuration through a pluggable store, and asynchronously
//! delivers batched reports to collector endpoints with retry, backoff, and
//! at-most-one-upload-per-group semantics.

pub mod cache;
pub mod config;
mod delivery;
pub mod header;
pub mod metrics_defs;
pub mod remover;
pub mod service;
pub mod store;
pub mod types;
pub mod uploader;

#[cfg(test)]
mod testutils;

pub use cache::CacheObserver;
pub use config::{ReportingPolicy, ServiceConfig};
pub use header::parse_reporting_endpoints;
pub use remover::DataTypeMask;
pub use service::{PermissiveDelegate, ReportingDelegate, ReportingService};
pub use store::{FilesystemStore, NoopStore, ReportingStore, StoreError, StoredClients};
pub use types::{
    IsolationInfo, PartitionKey, Report, ReportId, ReportStatus, ReportingSource,
};
pub use uploader::{HttpUploader, UploadOutcome, Uploader};
