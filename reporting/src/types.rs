use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

/// Opaque identifier for a document that configured endpoints via the
/// `Reporting-Endpoints` header.
pub type ReportingSource = Uuid;

/// Arena key for a report owned by the cache. Monotonically increasing;
/// insertion order equals id order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportId(pub(crate) u64);

/// Opaque tag equating network contexts. Reports and endpoint groups with
/// different partition keys never share state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(Option<String>);

impl PartitionKey {
    pub fn new<S: Into<String>>(site: S) -> Self {
        PartitionKey(Some(site.into()))
    }

    /// The collapsed bucket used when partition keys are not respected.
    pub const fn empty() -> Self {
        PartitionKey(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn site(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(site) => write!(f, "{}", site),
            None => write!(f, "(empty)"),
        }
    }
}

/// Embedder-provided record describing the isolation context that produced a
/// V1 endpoint registration. Opaque to the core; retained for introspection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationInfo(Option<String>);

impl IsolationInfo {
    pub fn new<S: Into<String>>(tag: S) -> Self {
        IsolationInfo(Some(tag.into()))
    }

    pub const fn empty() -> Self {
        IsolationInfo(None)
    }

    pub fn tag(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// Delivery state of a queued report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportStatus {
    /// Accepted and waiting for a delivery tick.
    Queued,
    /// Part of an in-flight upload.
    Pending,
    /// Flagged for deletion but retained while an upload references it.
    Doomed,
    /// Delivered; removed from the cache immediately after.
    Success,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Queued => "queued",
            ReportStatus::Pending => "pending",
            ReportStatus::Doomed => "doomed",
            ReportStatus::Success => "success",
        }
    }
}

/// A single ingressed report.
#[derive(Clone, Debug)]
pub struct Report {
    /// Sanitized to its origin form; no path, userinfo, or fragment.
    pub url: Url,
    pub source: Option<ReportingSource>,
    pub partition: PartitionKey,
    pub user_agent: String,
    pub group: String,
    pub report_type: String,
    pub body: serde_json::Value,
    /// How many reports of this chain were generated by reporting uploads
    /// themselves. Used by embedders to stop cascades.
    pub depth: usize,
    pub queued: Instant,
    pub attempts: usize,
    pub status: ReportStatus,
}

/// Key of an endpoint group. Source-keyed (V1) and origin-keyed (legacy)
/// groups never collide because `source` presence differs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointGroupKey {
    pub source: Option<ReportingSource>,
    pub partition: PartitionKey,
    /// Origin form only (path is "/").
    pub origin: Url,
    pub group: String,
}

/// Wall-clock expiry of an endpoint group. V1 document endpoints live until
/// their source is removed and never expire on their own.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Expiry {
    Never,
    At(SystemTime),
}

impl Expiry {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(when) => *when <= now,
        }
    }
}

/// Per-endpoint delivery statistics, surfaced in the status snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointStats {
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub last_used: Option<SystemTime>,
}

/// A single collector URL within an endpoint group.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub url: Url,
    /// Lower value wins. Defaults to 1.
    pub priority: u32,
    /// Relative share within a priority band. Always >= 1.
    pub weight: u32,
    pub stats: EndpointStats,
    /// Set while an upload against this endpoint is in flight.
    pub pending_upload: bool,
}

impl Endpoint {
    pub fn new(url: Url, priority: u32, weight: u32) -> Self {
        Endpoint {
            url,
            priority,
            weight,
            stats: EndpointStats::default(),
            pending_upload: false,
        }
    }
}

/// Named bucket of endpoints sharing an expiry and subdomain policy.
#[derive(Clone, Debug)]
pub struct EndpointGroup {
    pub key: EndpointGroupKey,
    pub include_subdomains: bool,
    pub expires: Expiry,
    pub last_used: SystemTime,
    pub endpoints: Vec<Endpoint>,
}

impl EndpointGroup {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_expired(now)
    }

    /// Best (numerically smallest) endpoint priority; groups with no
    /// endpoints sort behind everything for eviction.
    pub(crate) fn best_priority(&self) -> u32 {
        self.endpoints
            .iter()
            .map(|e| e.priority)
            .min()
            .unwrap_or(u32::MAX)
    }
}

/// Reduces a URL to the opaque origin form reports are keyed by:
/// scheme + host + port, no path, no userinfo, no fragment. Returns `None`
/// for URLs without a meaningful origin (data:, blob:, mailto:, ...).
pub fn sanitize_report_url(url: &Url) -> Option<Url> {
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return None;
    }
    let origin = url.origin();
    if !origin.is_tuple() {
        return None;
    }
    Url::parse(&origin.ascii_serialization()).ok()
}
