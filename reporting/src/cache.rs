//! In-memory model of reports, endpoint groups, and endpoints.
//!
//! The cache is owned exclusively by the service and locked around short,
//! non-suspending critical sections; observers receive edge notifications
//! after each mutation.

use crate::config::ReportingPolicy;
use crate::metrics_defs::{REPORTS_EVICTED, REPORTS_QUEUED};
use crate::store::{StoredClients, StoredEndpoint, StoredEndpointGroup};
use crate::types::{
    Endpoint, EndpointGroup, EndpointGroupKey, Expiry, IsolationInfo, PartitionKey, Report,
    ReportId, ReportStatus, ReportingSource,
};
use serde_json::{Value, json};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use url::Url;

/// Read-only edge notifications about cache mutations.
pub trait CacheObserver: Send + Sync {
    fn on_reports_updated(&self) {}
    fn on_clients_updated(&self) {}
}

/// One delivery unit: the reports of a single endpoint-group key, oldest
/// first.
#[derive(Clone, Debug)]
pub struct DeliveryBatch {
    pub group_key: EndpointGroupKey,
    pub report_ids: Vec<ReportId>,
}

/// The context a V1 source registration arrived in.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub origin: Url,
    pub partition: PartitionKey,
    pub isolation_info: IsolationInfo,
}

pub struct ReportingCache {
    policy: ReportingPolicy,
    next_report_id: u64,
    /// Keyed by monotonically increasing id; id order is insertion order.
    reports: BTreeMap<ReportId, Report>,
    groups: HashMap<EndpointGroupKey, EndpointGroup>,
    /// V1 registrations by source token.
    sources: HashMap<ReportingSource, SourceInfo>,
    /// Sources tombstoned by `set_expired_source`; erased once drained.
    expired_sources: HashSet<ReportingSource>,
    observers: Vec<Weak<dyn CacheObserver>>,
    clients_dirty: bool,
}

impl ReportingCache {
    pub fn new(policy: ReportingPolicy) -> Self {
        ReportingCache {
            policy,
            next_report_id: 0,
            reports: BTreeMap::new(),
            groups: HashMap::new(),
            sources: HashMap::new(),
            expired_sources: HashSet::new(),
            observers: Vec::new(),
            clients_dirty: false,
        }
    }

    pub fn add_observer(&mut self, observer: &Arc<dyn CacheObserver>) {
        self.observers.push(Arc::downgrade(observer));
    }

    pub fn remove_observer(&mut self, observer: &Arc<dyn CacheObserver>) {
        self.observers
            .retain(|o| !o.ptr_eq(&Arc::downgrade(observer)));
    }

    fn notify_reports_updated(&mut self) {
        self.observers.retain(|o| o.upgrade().is_some());
        for observer in &self.observers {
            if let Some(observer) = observer.upgrade() {
                observer.on_reports_updated();
            }
        }
    }

    fn notify_clients_updated(&mut self) {
        self.observers.retain(|o| o.upgrade().is_some());
        for observer in &self.observers {
            if let Some(observer) = observer.upgrade() {
                observer.on_clients_updated();
            }
        }
    }

    // --- reports ---

    #[allow(clippy::too_many_arguments)]
    pub fn add_report(
        &mut self,
        source: Option<ReportingSource>,
        partition: PartitionKey,
        url: Url,
        user_agent: String,
        group: String,
        report_type: String,
        body: Value,
        depth: usize,
        queued: Instant,
        attempts: usize,
    ) -> ReportId {
        let id = ReportId(self.next_report_id);
        self.next_report_id += 1;
        self.reports.insert(
            id,
            Report {
                url,
                source,
                partition,
                user_agent,
                group,
                report_type,
                body,
                depth,
                queued,
                attempts,
                status: ReportStatus::Queued,
            },
        );
        metrics::counter!(REPORTS_QUEUED.name).increment(1);
        self.enforce_report_cap(id);
        self.notify_reports_updated();
        id
    }

    /// Evicts oldest queued reports past the cap; when everything else is in
    /// flight, dooms the oldest pending report instead so delivery discards
    /// it on completion. Ingress is never rejected, so the incoming report
    /// is not an eviction candidate.
    fn enforce_report_cap(&mut self, just_added: ReportId) {
        while self.visible_report_count() > self.policy.max_report_count {
            let victim = self
                .reports
                .iter()
                .filter(|(id, r)| **id != just_added && r.status == ReportStatus::Queued)
                .min_by_key(|(id, r)| (r.queued, **id))
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    self.reports.remove(&id);
                    metrics::counter!(REPORTS_EVICTED.name).increment(1);
                }
                None => {
                    let oldest_pending = self
                        .reports
                        .iter()
                        .filter(|(_, r)| r.status == ReportStatus::Pending)
                        .min_by_key(|(id, r)| (r.queued, **id))
                        .map(|(id, _)| *id);
                    if let Some(id) = oldest_pending
                        && let Some(report) = self.reports.get_mut(&id)
                    {
                        report.status = ReportStatus::Doomed;
                        metrics::counter!(REPORTS_EVICTED.name).increment(1);
                    }
                    break;
                }
            }
        }
    }

    /// Queued reports batched per endpoint-group key, one batch per key in
    /// insertion order of its oldest report. Reports of expired sources are
    /// excluded.
    pub fn get_reports_to_deliver(&self) -> Vec<DeliveryBatch> {
        self.collect_batches(|_| true)
    }

    /// Like `get_reports_to_deliver`, restricted to one source.
    pub fn get_reports_for_source(&self, source: ReportingSource) -> Vec<DeliveryBatch> {
        self.collect_batches(|r| r.source == Some(source))
    }

    fn collect_batches<F: Fn(&Report) -> bool>(&self, include: F) -> Vec<DeliveryBatch> {
        let mut batches: Vec<DeliveryBatch> = Vec::new();
        let mut index: HashMap<EndpointGroupKey, usize> = HashMap::new();

        for (id, report) in &self.reports {
            if report.status != ReportStatus::Queued || !include(report) {
                continue;
            }
            if let Some(source) = report.source
                && self.expired_sources.contains(&source)
            {
                continue;
            }
            let key = self.nominal_group_key(report);
            match index.get(&key) {
                Some(&at) => batches[at].report_ids.push(*id),
                None => {
                    index.insert(key.clone(), batches.len());
                    batches.push(DeliveryBatch {
                        group_key: key,
                        report_ids: vec![*id],
                    });
                }
            }
        }
        batches
    }

    /// The group key a report nominally belongs to. Sourced reports use the
    /// origin and partition their source registered with, so they land on
    /// the V1 groups even if the report URL drifted.
    fn nominal_group_key(&self, report: &Report) -> EndpointGroupKey {
        if let Some(source) = report.source
            && let Some(info) = self.sources.get(&source)
        {
            return EndpointGroupKey {
                source: Some(source),
                partition: info.partition.clone(),
                origin: info.origin.clone(),
                group: report.group.clone(),
            };
        }
        EndpointGroupKey {
            source: report.source,
            partition: report.partition.clone(),
            origin: report.url.clone(),
            group: report.group.clone(),
        }
    }

    pub fn mark_pending(&mut self, ids: &[ReportId]) {
        for id in ids {
            if let Some(report) = self.reports.get_mut(id)
                && report.status == ReportStatus::Queued
            {
                report.status = ReportStatus::Pending;
            }
        }
        self.notify_reports_updated();
    }

    pub fn increment_attempts(&mut self, ids: &[ReportId]) {
        for id in ids {
            if let Some(report) = self.reports.get_mut(id) {
                report.attempts += 1;
            }
        }
    }

    /// Returns in-flight reports to the queue, preserving attempts. Doomed
    /// reports are discarded here; their flight is over.
    pub fn clear_pending(&mut self, ids: &[ReportId]) {
        for id in ids {
            match self.reports.get_mut(id).map(|r| r.status) {
                Some(ReportStatus::Doomed) => {
                    self.reports.remove(id);
                }
                Some(ReportStatus::Pending) => {
                    if let Some(report) = self.reports.get_mut(id) {
                        report.status = ReportStatus::Queued;
                    }
                }
                _ => {}
            }
        }
        self.notify_reports_updated();
    }

    pub fn remove_reports(&mut self, ids: &[ReportId]) {
        for id in ids {
            self.reports.remove(id);
        }
        self.notify_reports_updated();
    }

    // --- endpoint groups ---

    /// Resolves the group a batch delivers to: the exact key when it is
    /// live, otherwise the closest ancestor-domain group with
    /// `include_subdomains`. Expired groups are invisible here but stay in
    /// the cache until garbage collection.
    pub fn find_group_for_delivery(
        &self,
        nominal: &EndpointGroupKey,
        now: SystemTime,
    ) -> Option<(EndpointGroupKey, Vec<Endpoint>)> {
        if let Some(source) = nominal.source
            && self.expired_sources.contains(&source)
        {
            return None;
        }

        if let Some(group) = self.groups.get(nominal)
            && !group.is_expired(now)
            && !group.endpoints.is_empty()
        {
            return Some((nominal.clone(), group.endpoints.clone()));
        }

        if nominal.source.is_some() {
            return None;
        }
        let Some(url::Host::Domain(host)) = nominal.origin.host() else {
            return None;
        };

        let labels: Vec<&str> = host.split('.').collect();
        for start in 1..labels.len() {
            // never match a bare single-label ancestor
            if labels.len() - start < 2 {
                break;
            }
            let candidate = labels[start..].join(".");
            let found = self.groups.values().find(|g| {
                g.key.source.is_none()
                    && g.include_subdomains
                    && !g.is_expired(now)
                    && !g.endpoints.is_empty()
                    && g.key.group == nominal.group
                    && g.key.partition == nominal.partition
                    && g.key.origin.scheme() == nominal.origin.scheme()
                    && g.key.origin.port_or_known_default()
                        == nominal.origin.port_or_known_default()
                    && g.key.origin.host_str() == Some(candidate.as_str())
            });
            if let Some(group) = found {
                return Some((group.key.clone(), group.endpoints.clone()));
            }
        }
        None
    }

    pub fn mark_endpoint_pending(
        &mut self,
        key: &EndpointGroupKey,
        endpoint: &Url,
        pending: bool,
    ) {
        if let Some(group) = self.groups.get_mut(key)
            && let Some(endpoint) = group.endpoints.iter_mut().find(|e| &e.url == endpoint)
        {
            endpoint.pending_upload = pending;
        }
    }

    pub fn record_delivery_success(
        &mut self,
        key: &EndpointGroupKey,
        endpoint: &Url,
        now: SystemTime,
    ) {
        if let Some(group) = self.groups.get_mut(key) {
            group.last_used = now;
            if let Some(endpoint) = group.endpoints.iter_mut().find(|e| &e.url == endpoint) {
                endpoint.stats.successful_uploads += 1;
                endpoint.stats.last_used = Some(now);
            }
        }
    }

    pub fn record_delivery_failure(&mut self, key: &EndpointGroupKey, endpoint: &Url) {
        if let Some(group) = self.groups.get_mut(key)
            && let Some(endpoint) = group.endpoints.iter_mut().find(|e| &e.url == endpoint)
        {
            endpoint.stats.failed_uploads += 1;
        }
    }

    /// Deletes one endpoint (the 410 Gone path); a group left empty goes
    /// with it.
    pub fn remove_endpoint(&mut self, key: &EndpointGroupKey, endpoint: &Url) {
        let Some(group) = self.groups.get_mut(key) else {
            return;
        };
        let before = group.endpoints.len();
        group.endpoints.retain(|e| &e.url != endpoint);
        if group.endpoints.len() == before {
            return;
        }
        if group.endpoints.is_empty() {
            self.groups.remove(key);
        }
        if key.source.is_none() {
            self.clients_dirty = true;
        }
        self.notify_clients_updated();
    }

    pub fn set_endpoints_for_origin(
        &mut self,
        partition: PartitionKey,
        origin: Url,
        group_name: String,
        include_subdomains: bool,
        expires: Expiry,
        mut endpoints: Vec<Endpoint>,
    ) {
        let key = EndpointGroupKey {
            source: None,
            partition,
            origin,
            group: group_name,
        };
        let now = SystemTime::now();

        endpoints.sort_by_key(|e| e.priority);
        endpoints.truncate(self.policy.max_endpoints_per_origin);

        // a replace keeps the stats of endpoints that survive it
        let mut last_used = now;
        if let Some(existing) = self.groups.get(&key) {
            last_used = existing.last_used;
            for endpoint in &mut endpoints {
                if let Some(old) = existing.endpoints.iter().find(|o| o.url == endpoint.url) {
                    endpoint.stats = old.stats;
                }
            }
        }

        self.groups.insert(
            key.clone(),
            EndpointGroup {
                key: key.clone(),
                include_subdomains,
                expires,
                last_used,
                endpoints,
            },
        );
        self.enforce_origin_group_cap(&key);
        self.enforce_global_endpoint_cap(&key, now);
        self.clients_dirty = true;
        self.notify_clients_updated();
    }

    fn enforce_origin_group_cap(&mut self, protect: &EndpointGroupKey) {
        loop {
            let victims: Vec<&EndpointGroup> = self
                .groups
                .values()
                .filter(|g| {
                    g.key.source.is_none()
                        && g.key.origin == protect.origin
                        && g.key.partition == protect.partition
                })
                .collect();
            if victims.len() <= self.policy.max_endpoints_per_origin {
                return;
            }
            let Some(victim) = victims
                .into_iter()
                .filter(|g| &g.key != protect)
                .max_by_key(|g| (g.best_priority(), Reverse(g.last_used)))
                .map(|g| g.key.clone())
            else {
                return;
            };
            self.groups.remove(&victim);
        }
    }

    fn enforce_global_endpoint_cap(&mut self, protect: &EndpointGroupKey, now: SystemTime) {
        loop {
            let total: usize = self.groups.values().map(|g| g.endpoints.len()).sum();
            if total <= self.policy.max_endpoint_count {
                return;
            }
            let Some(victim) = self
                .groups
                .values()
                .filter(|g| &g.key != protect)
                .max_by_key(|g| (g.is_expired(now), g.best_priority(), Reverse(g.last_used)))
                .map(|g| g.key.clone())
            else {
                return;
            };
            self.groups.remove(&victim);
        }
    }

    pub fn remove_endpoint_group(
        &mut self,
        partition: &PartitionKey,
        origin: &Url,
        group_name: &str,
    ) {
        let key = EndpointGroupKey {
            source: None,
            partition: partition.clone(),
            origin: origin.clone(),
            group: group_name.to_string(),
        };
        if self.groups.remove(&key).is_some() {
            self.clients_dirty = true;
            self.notify_clients_updated();
        }
    }

    // --- V1 document endpoints ---

    /// Installs a V1 registration as one single-endpoint group per name,
    /// replacing any previous registration for the source.
    pub fn set_document_endpoints(
        &mut self,
        source: ReportingSource,
        isolation_info: IsolationInfo,
        partition: PartitionKey,
        origin: Url,
        endpoints: Vec<(String, Url)>,
    ) {
        if source.is_nil() {
            return;
        }
        self.groups.retain(|k, _| k.source != Some(source));

        let now = SystemTime::now();
        for (name, url) in endpoints {
            let key = EndpointGroupKey {
                source: Some(source),
                partition: partition.clone(),
                origin: origin.clone(),
                group: name,
            };
            self.groups.insert(
                key.clone(),
                EndpointGroup {
                    key,
                    include_subdomains: false,
                    expires: Expiry::Never,
                    last_used: now,
                    endpoints: vec![Endpoint::new(url, 1, 1)],
                },
            );
        }
        self.sources.insert(
            source,
            SourceInfo {
                origin,
                partition,
                isolation_info,
            },
        );
        self.notify_clients_updated();
    }

    /// Tombstones a source: no new deliveries are created for it, and it is
    /// erased once its remaining reports drain.
    pub fn set_expired_source(&mut self, source: ReportingSource) {
        self.expired_sources.insert(source);
    }

    pub fn remove_reports_for_source(&mut self, source: ReportingSource) {
        self.reports.retain(|_, r| r.source != Some(source));
        self.notify_reports_updated();
    }

    pub fn remove_endpoints_for_source(&mut self, source: ReportingSource) {
        self.groups.retain(|k, _| k.source != Some(source));
        self.sources.remove(&source);
        self.notify_clients_updated();
    }

    // --- browsing data ---

    /// Removes reports whose origin matches; in-flight reports are doomed
    /// instead so delivery discards them on completion.
    pub fn remove_reports_matching(&mut self, origin_filter: &dyn Fn(&Url) -> bool) {
        let matching: Vec<ReportId> = self
            .reports
            .iter()
            .filter(|(_, r)| origin_filter(&r.url))
            .map(|(id, _)| *id)
            .collect();
        for id in matching {
            let in_flight = self
                .reports
                .get(&id)
                .is_some_and(|r| r.status == ReportStatus::Pending);
            if in_flight {
                if let Some(report) = self.reports.get_mut(&id) {
                    report.status = ReportStatus::Doomed;
                }
            } else {
                self.reports.remove(&id);
            }
        }
        self.notify_reports_updated();
    }

    pub fn remove_clients_matching(&mut self, origin_filter: &dyn Fn(&Url) -> bool) {
        self.groups.retain(|k, _| !origin_filter(&k.origin));
        self.sources.retain(|_, info| !origin_filter(&info.origin));
        self.clients_dirty = true;
        self.notify_clients_updated();
    }

    // --- store integration ---

    /// Installs the loaded snapshot in one step. Entries whose key was
    /// already created by a header that raced ahead of the load are left
    /// alone.
    pub fn install_loaded_clients(&mut self, loaded: StoredClients) {
        let mut installed: HashSet<EndpointGroupKey> = HashSet::new();

        for stored in loaded.endpoint_groups {
            let key = EndpointGroupKey {
                source: None,
                partition: stored.partition,
                origin: stored.origin,
                group: stored.group,
            };
            if self.groups.contains_key(&key) {
                continue;
            }
            installed.insert(key.clone());
            self.groups.insert(
                key.clone(),
                EndpointGroup {
                    key,
                    include_subdomains: stored.include_subdomains,
                    expires: Expiry::At(from_unix_ms(stored.expires_unix_ms)),
                    last_used: from_unix_ms(stored.last_used_unix_ms),
                    endpoints: Vec::new(),
                },
            );
        }

        for stored in loaded.endpoints {
            let key = EndpointGroupKey {
                source: None,
                partition: stored.partition,
                origin: stored.origin,
                group: stored.group,
            };
            if !installed.contains(&key) {
                continue;
            }
            if let Some(group) = self.groups.get_mut(&key) {
                group
                    .endpoints
                    .push(Endpoint::new(stored.url, stored.priority, stored.weight));
            }
        }
        self.notify_clients_updated();
    }

    pub fn clients_dirty(&self) -> bool {
        self.clients_dirty
    }

    pub fn mark_clients_flushed(&mut self) {
        self.clients_dirty = false;
    }

    /// Deterministic persisted snapshot of the origin-keyed clients.
    pub fn stored_clients(&self) -> StoredClients {
        let mut groups: Vec<&EndpointGroup> = self
            .groups
            .values()
            .filter(|g| g.key.source.is_none())
            .collect();
        groups.sort_by(|a, b| {
            (a.key.origin.as_str(), a.key.partition.site(), &a.key.group).cmp(&(
                b.key.origin.as_str(),
                b.key.partition.site(),
                &b.key.group,
            ))
        });

        let mut endpoint_groups = Vec::with_capacity(groups.len());
        let mut endpoints = Vec::new();
        for group in groups {
            endpoint_groups.push(StoredEndpointGroup {
                origin: group.key.origin.clone(),
                partition: group.key.partition.clone(),
                group: group.key.group.clone(),
                include_subdomains: group.include_subdomains,
                expires_unix_ms: match group.expires {
                    Expiry::At(when) => to_unix_ms(when),
                    Expiry::Never => 0,
                },
                last_used_unix_ms: to_unix_ms(group.last_used),
            });
            for endpoint in &group.endpoints {
                endpoints.push(StoredEndpoint {
                    origin: group.key.origin.clone(),
                    partition: group.key.partition.clone(),
                    group: group.key.group.clone(),
                    url: endpoint.url.clone(),
                    priority: endpoint.priority,
                    weight: endpoint.weight,
                });
            }
        }
        StoredClients {
            endpoint_groups,
            endpoints,
        }
    }

    // --- garbage collection ---

    /// Drops aged-out reports, stale expired groups, and drained expired
    /// sources.
    pub fn collect_garbage(&mut self, now: SystemTime, now_tick: Instant) {
        let mut reports_changed = false;
        let mut clients_changed = false;

        let max_age = self.policy.max_report_age();
        let aged: Vec<ReportId> = self
            .reports
            .iter()
            .filter(|(_, r)| {
                r.status == ReportStatus::Queued && now_tick.duration_since(r.queued) >= max_age
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &aged {
            self.reports.remove(id);
            reports_changed = true;
        }

        let staleness = self.policy.max_group_staleness();
        let before = self.groups.len();
        self.groups.retain(|_, g| match g.expires {
            Expiry::At(when) => when + staleness > now,
            Expiry::Never => true,
        });
        if self.groups.len() != before {
            clients_changed = true;
            self.clients_dirty = true;
        }

        let drained: Vec<ReportingSource> = self
            .expired_sources
            .iter()
            .filter(|s| !self.reports.values().any(|r| r.source == Some(**s)))
            .copied()
            .collect();
        for source in drained {
            self.expired_sources.remove(&source);
            self.groups.retain(|k, _| k.source != Some(source));
            self.sources.remove(&source);
            clients_changed = true;
        }

        if reports_changed {
            self.notify_reports_updated();
        }
        if clients_changed {
            self.notify_clients_updated();
        }
    }

    // --- introspection ---

    pub fn get_report(&self, id: ReportId) -> Option<&Report> {
        self.reports.get(&id)
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    pub fn report_count(&self) -> usize {
        self.reports.len()
    }

    /// Reports that count against the cap; doomed zombies are excluded.
    pub fn visible_report_count(&self) -> usize {
        self.reports
            .values()
            .filter(|r| r.status != ReportStatus::Doomed)
            .count()
    }

    pub fn get_endpoint_group(
        &self,
        partition: &PartitionKey,
        origin: &Url,
        group_name: &str,
    ) -> Option<&EndpointGroup> {
        self.groups.get(&EndpointGroupKey {
            source: None,
            partition: partition.clone(),
            origin: origin.clone(),
            group: group_name.to_string(),
        })
    }

    pub fn endpoint_group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn has_source(&self, source: ReportingSource) -> bool {
        self.sources.contains_key(&source)
    }

    pub fn reports_as_value(&self, now: Instant) -> Value {
        let entries: Vec<Value> = self
            .reports
            .values()
            .map(|r| {
                json!({
                    "url": r.url.as_str(),
                    "group": r.group,
                    "type": r.report_type,
                    "status": r.status.as_str(),
                    "depth": r.depth,
                    "attempts": r.attempts,
                    "ageMs": now.duration_since(r.queued).as_millis() as u64,
                    "partition": r.partition.to_string(),
                    "source": r.source.map(|s| s.to_string()),
                })
            })
            .collect();
        Value::Array(entries)
    }

    pub fn clients_as_value(&self) -> Value {
        let mut groups: Vec<&EndpointGroup> = self.groups.values().collect();
        groups.sort_by(|a, b| {
            (a.key.origin.as_str(), a.key.partition.site(), &a.key.group).cmp(&(
                b.key.origin.as_str(),
                b.key.partition.site(),
                &b.key.group,
            ))
        });

        let entries: Vec<Value> = groups
            .into_iter()
            .map(|g| {
                let endpoints: Vec<Value> = g
                    .endpoints
                    .iter()
                    .map(|e| {
                        json!({
                            "url": e.url.as_str(),
                            "priority": e.priority,
                            "weight": e.weight,
                            "successfulUploads": e.stats.successful_uploads,
                            "failedUploads": e.stats.failed_uploads,
                            "pendingUpload": e.pending_upload,
                        })
                    })
                    .collect();
                let isolation_info = g
                    .key
                    .source
                    .and_then(|s| self.sources.get(&s))
                    .and_then(|info| info.isolation_info.tag().map(str::to_string));
                json!({
                    "origin": g.key.origin.as_str(),
                    "partition": g.key.partition.to_string(),
                    "group": g.key.group,
                    "includeSubdomains": g.include_subdomains,
                    "expires": match g.expires {
                        Expiry::At(when) => Value::from(to_unix_ms(when)),
                        Expiry::Never => Value::Null,
                    },
                    "source": g.key.source.map(|s| s.to_string()),
                    "isolationInfo": isolation_info,
                    "endpoints": endpoints,
                })
            })
            .collect();
        Value::Array(entries)
    }
}

fn to_unix_ms(when: SystemTime) -> u64 {
    when.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn from_unix_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}
