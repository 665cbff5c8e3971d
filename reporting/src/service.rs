//! Public entry point for the reporting core.
//!
//! Every mutating operation goes through a gating wrapper: after shutdown it
//! is dropped; while a configured store is still loading it is captured into
//! a FIFO backlog; otherwise it executes synchronously. The backlog is the
//! only asynchronous suspension point of the facade, and shutdown during the
//! load discards it.

use crate::cache::{CacheObserver, ReportingCache};
use crate::config::{ReportingPolicy, ServiceConfig};
use crate::delivery::{DeliveryAgent, DeliveryCommand};
use crate::header::{self, MAX_HEADER_SIZE, MAX_JSON_DEPTH};
use crate::metrics_defs::{HEADERS_PROCESSED, HEADERS_REJECTED, REPORTS_DROPPED};
use crate::remover::{self, DataTypeMask};
use crate::store::{ReportingStore, StoreError};
use crate::types::{IsolationInfo, PartitionKey, ReportingSource, sanitize_report_url};
use crate::uploader::Uploader;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use url::Url;

/// Embedder policy hook consulted before any report is queued.
pub trait ReportingDelegate: Send + Sync {
    fn can_queue_report(&self, origin: &Url) -> bool;
}

/// Allows everything; the default embedder policy.
pub struct PermissiveDelegate;

impl ReportingDelegate for PermissiveDelegate {
    fn can_queue_report(&self, _origin: &Url) -> bool {
        true
    }
}

/// The collaborators and shared state of one service instance. The cache is
/// owned here exclusively; lock scopes never span a suspension point.
pub(crate) struct ReportingContext {
    pub(crate) policy: ReportingPolicy,
    pub(crate) cache: Mutex<ReportingCache>,
    pub(crate) uploader: Arc<dyn Uploader>,
    pub(crate) store: Option<Arc<dyn ReportingStore>>,
    pub(crate) delegate: Arc<dyn ReportingDelegate>,
}

impl ReportingContext {
    pub(crate) fn new(
        policy: ReportingPolicy,
        uploader: Arc<dyn Uploader>,
        store: Option<Arc<dyn ReportingStore>>,
        delegate: Arc<dyn ReportingDelegate>,
    ) -> Self {
        ReportingContext {
            cache: Mutex::new(ReportingCache::new(policy.clone())),
            policy,
            uploader,
            store,
            delegate,
        }
    }
}

/// A captured ingress operation, deferred while the store load is pending.
enum Task {
    QueueReport {
        source: Option<ReportingSource>,
        partition: PartitionKey,
        url: Url,
        user_agent: String,
        group: String,
        report_type: String,
        body: Value,
        depth: usize,
        queued: Instant,
    },
    ProcessReportToHeader {
        partition: PartitionKey,
        origin: Url,
        value: Value,
    },
    SetDocumentEndpoints {
        source: ReportingSource,
        isolation_info: IsolationInfo,
        partition: PartitionKey,
        origin: Url,
        endpoints: Vec<(String, Url)>,
    },
    RemoveBrowsingData {
        mask: DataTypeMask,
        origin_filter: Arc<dyn Fn(&Url) -> bool + Send + Sync>,
    },
    RemoveAllBrowsingData {
        mask: DataTypeMask,
    },
}

struct ServiceState {
    shut_down: bool,
    started_loading: bool,
    initialized: bool,
    backlog: VecDeque<Task>,
}

struct ServiceCore {
    context: Arc<ReportingContext>,
    respect_partition_key: bool,
    state: Mutex<ServiceState>,
    delivery_tx: mpsc::Sender<DeliveryCommand>,
}

/// Cheaply cloneable handle to one reporting service instance.
#[derive(Clone)]
pub struct ReportingService {
    inner: Arc<ServiceCore>,
}

impl ReportingService {
    /// Must be called on a tokio runtime; spawns the delivery worker.
    /// Without a store the service is initialized immediately.
    pub fn new(
        config: ServiceConfig,
        uploader: Arc<dyn Uploader>,
        store: Option<Arc<dyn ReportingStore>>,
        delegate: Arc<dyn ReportingDelegate>,
    ) -> Self {
        let context = Arc::new(ReportingContext::new(
            config.policy,
            uploader,
            store,
            delegate,
        ));
        let (delivery_tx, delivery_rx) = mpsc::channel(64);
        tokio::spawn(DeliveryAgent::new(context.clone()).run(delivery_rx));

        let initialized = context.store.is_none();
        ReportingService {
            inner: Arc::new(ServiceCore {
                context,
                respect_partition_key: config.respect_partition_key,
                state: Mutex::new(ServiceState {
                    shut_down: false,
                    started_loading: false,
                    initialized,
                    backlog: VecDeque::new(),
                }),
                delivery_tx,
            }),
        }
    }

    /// Queues a report against `group` for the origin of `url`. The URL is
    /// reduced to its origin; the queued tick is captured before gating so
    /// backlog replay preserves chronological age.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_report(
        &self,
        url: &Url,
        source: Option<ReportingSource>,
        partition: &PartitionKey,
        user_agent: &str,
        group: &str,
        report_type: &str,
        body: Value,
        depth: usize,
    ) {
        debug_assert!(source.is_none_or(|s| !s.is_nil()));

        let Some(origin) = sanitize_report_url(url) else {
            metrics::counter!(REPORTS_DROPPED.name, "reason" => "invalid_url").increment(1);
            return;
        };
        if !self.inner.context.delegate.can_queue_report(&origin) {
            metrics::counter!(REPORTS_DROPPED.name, "reason" => "denied").increment(1);
            return;
        }

        let queued = Instant::now();
        self.do_or_backlog(Task::QueueReport {
            source,
            partition: self.fixup_partition_key(partition),
            url: origin,
            user_agent: user_agent.to_string(),
            group: group.to_string(),
            report_type: report_type.to_string(),
            body,
            depth,
            queued,
        });
    }

    /// Applies a `Report-To` header received on `url`. The raw value is
    /// size-limited, wrapped in brackets, and depth-checked before gating;
    /// anything malformed is dropped without notice.
    pub fn process_report_to_header(
        &self,
        url: &Url,
        partition: &PartitionKey,
        header_value: &str,
    ) {
        if header_value.len() > MAX_HEADER_SIZE {
            metrics::counter!(HEADERS_REJECTED.name, "reason" => "too_large").increment(1);
            return;
        }
        let wrapped = format!("[{header_value}]");
        let Ok(value) = serde_json::from_str::<Value>(&wrapped) else {
            metrics::counter!(HEADERS_REJECTED.name, "reason" => "parse").increment(1);
            return;
        };
        if header::json_depth(&value) > MAX_JSON_DEPTH {
            metrics::counter!(HEADERS_REJECTED.name, "reason" => "depth").increment(1);
            return;
        }
        let Some(origin) = sanitize_report_url(url) else {
            metrics::counter!(HEADERS_REJECTED.name, "reason" => "invalid_url").increment(1);
            return;
        };

        metrics::counter!(HEADERS_PROCESSED.name).increment(1);
        self.do_or_backlog(Task::ProcessReportToHeader {
            partition: self.fixup_partition_key(partition),
            origin,
            value,
        });
    }

    /// Installs V1 document endpoints for a reporting source. The source
    /// token must be non-nil; endpoint URLs may be relative to `origin`.
    pub fn set_document_reporting_endpoints(
        &self,
        source: ReportingSource,
        origin: &Url,
        isolation_info: IsolationInfo,
        partition: &PartitionKey,
        endpoints: BTreeMap<String, String>,
    ) {
        debug_assert!(!source.is_nil());
        if source.is_nil() {
            return;
        }
        let Some(origin) = sanitize_report_url(origin) else {
            return;
        };
        let endpoints = header::validate_document_endpoints(&origin, &endpoints);

        self.do_or_backlog(Task::SetDocumentEndpoints {
            source,
            isolation_info,
            partition: self.fixup_partition_key(partition),
            origin,
            endpoints,
        });
    }

    /// Flushes everything queued for `source` ahead of the delivery cadence
    /// and tombstones the source. In-flight uploads run to completion and
    /// their reports are discarded on success.
    pub async fn send_reports_and_remove_source(&self, source: ReportingSource) {
        debug_assert!(!source.is_nil());
        if self.inner.state.lock().shut_down {
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .inner
            .delivery_tx
            .send(DeliveryCommand::SendReportsForSource(source, ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        self.inner.context.cache.lock().set_expired_source(source);
    }

    pub fn remove_browsing_data(
        &self,
        mask: DataTypeMask,
        origin_filter: Arc<dyn Fn(&Url) -> bool + Send + Sync>,
    ) {
        self.do_or_backlog(Task::RemoveBrowsingData {
            mask,
            origin_filter,
        });
    }

    pub fn remove_all_browsing_data(&self, mask: DataTypeMask) {
        self.do_or_backlog(Task::RemoveAllBrowsingData { mask });
    }

    /// Writes the client set to the store if it is dirty.
    pub async fn flush(&self) -> Result<(), StoreError> {
        if !self.inner.state.lock().initialized {
            return Ok(());
        }
        self.flush_clients().await
    }

    /// Terminal: drops the backlog, persists clients if initialized, and
    /// stops the delivery worker, abandoning in-flight uploads. Subsequent
    /// calls are no-ops.
    pub async fn on_shutdown(&self) {
        let flush_clients = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.backlog.clear();
            state.initialized
        };

        if flush_clients
            && let Err(e) = self.flush_clients().await
        {
            tracing::warn!(error = %e, "failed to persist reporting clients at shutdown");
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .inner
            .delivery_tx
            .send(DeliveryCommand::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Snapshot of clients and reports for introspection.
    pub fn status_as_value(&self) -> Value {
        let cache = self.inner.context.cache.lock();
        json!({
            "reportingEnabled": true,
            "clients": cache.clients_as_value(),
            "reports": cache.reports_as_value(Instant::now()),
        })
    }

    pub fn policy(&self) -> &ReportingPolicy {
        &self.inner.context.policy
    }

    pub fn add_observer(&self, observer: &Arc<dyn CacheObserver>) {
        self.inner.context.cache.lock().add_observer(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn CacheObserver>) {
        self.inner.context.cache.lock().remove_observer(observer);
    }

    fn fixup_partition_key(&self, partition: &PartitionKey) -> PartitionKey {
        if self.inner.respect_partition_key {
            partition.clone()
        } else {
            PartitionKey::empty()
        }
    }

    fn do_or_backlog(&self, task: Task) {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return;
        }

        if self.inner.context.store.is_some() && !state.started_loading {
            state.started_loading = true;
            let service = self.clone();
            tokio::spawn(async move { service.load_clients().await });
        }

        if !state.initialized {
            state.backlog.push_back(task);
            return;
        }
        drop(state);
        self.execute(task);
    }

    async fn load_clients(&self) {
        let Some(store) = self.inner.context.store.clone() else {
            return;
        };
        let loaded = store.load().await;

        let backlog: Vec<Task> = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                state.backlog.clear();
                return;
            }
            state.initialized = true;
            match loaded {
                Ok(clients) => {
                    self.inner.context.cache.lock().install_loaded_clients(clients);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load reporting clients, starting empty");
                }
            }
            state.backlog.drain(..).collect()
        };

        for task in backlog {
            self.execute(task);
        }
    }

    fn execute(&self, task: Task) {
        let mut cache = self.inner.context.cache.lock();
        match task {
            Task::QueueReport {
                source,
                partition,
                url,
                user_agent,
                group,
                report_type,
                body,
                depth,
                queued,
            } => {
                cache.add_report(
                    source,
                    partition,
                    url,
                    user_agent,
                    group,
                    report_type,
                    body,
                    depth,
                    queued,
                    0,
                );
            }
            Task::ProcessReportToHeader {
                partition,
                origin,
                value,
            } => {
                header::parse_report_to_header(&mut cache, &partition, &origin, &value);
            }
            Task::SetDocumentEndpoints {
                source,
                isolation_info,
                partition,
                origin,
                endpoints,
            } => {
                cache.set_document_endpoints(source, isolation_info, partition, origin, endpoints);
            }
            Task::RemoveBrowsingData {
                mask,
                origin_filter,
            } => {
                remover::remove_browsing_data(&mut cache, mask, origin_filter.as_ref());
            }
            Task::RemoveAllBrowsingData { mask } => {
                remover::remove_all_browsing_data(&mut cache, mask);
            }
        }
    }

    async fn flush_clients(&self) -> Result<(), StoreError> {
        let Some(store) = self.inner.context.store.clone() else {
            return Ok(());
        };
        let snapshot = {
            let mut cache = self.inner.context.cache.lock();
            if !cache.clients_dirty() {
                return Ok(());
            }
            let snapshot = cache.stored_clients();
            cache.mark_clients_flushed();
            snapshot
        };
        store.store(&snapshot).await
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<ReportingContext> {
        &self.inner.context
    }
}
