//! Selects eligible reports, batches them, drives the uploader, and applies
//! retry and backoff.
//!
//! A single worker task owns the delivery and garbage-collection timers and
//! processes upload completions, so all cache mutations for delivery happen
//! on one task. Uploads fan out through a `JoinSet`; at most one upload per
//! endpoint group is in flight at any time.

use crate::cache::DeliveryBatch;
use crate::metrics_defs::UPLOAD_OUTCOME;
use crate::service::ReportingContext;
use crate::types::{Endpoint, EndpointGroupKey, PartitionKey, ReportId, ReportingSource};
use crate::uploader::UploadOutcome;
use bytes::Bytes;
use rand::Rng;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use url::Url;

pub(crate) enum DeliveryCommand {
    /// Dispatch everything queued for one source immediately.
    SendReportsForSource(ReportingSource, oneshot::Sender<()>),
    /// Abandon in-flight uploads and stop the worker.
    Shutdown(oneshot::Sender<()>),
}

struct FinishedUpload {
    group_key: EndpointGroupKey,
    endpoint: Url,
    report_ids: Vec<ReportId>,
    outcome: UploadOutcome,
}

struct EndpointBackoff {
    consecutive_failures: u32,
    next_eligible: Instant,
}

pub(crate) struct DeliveryAgent {
    context: Arc<ReportingContext>,
    /// Endpoint groups with an upload in flight.
    in_flight: HashSet<EndpointGroupKey>,
    backoff: HashMap<Url, EndpointBackoff>,
}

impl DeliveryAgent {
    pub(crate) fn new(context: Arc<ReportingContext>) -> Self {
        DeliveryAgent {
            context,
            in_flight: HashSet::new(),
            backoff: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<DeliveryCommand>) {
        let delivery_period = self.context.policy.delivery_interval();
        let gc_period = self.context.policy.garbage_collection_interval();
        let mut delivery = interval_at(Instant::now() + delivery_period, delivery_period);
        delivery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gc = interval_at(Instant::now() + gc_period, gc_period);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut uploads: JoinSet<FinishedUpload> = JoinSet::new();

        loop {
            tokio::select! {
                _ = delivery.tick() => {
                    let batches = self.context.cache.lock().get_reports_to_deliver();
                    self.dispatch_batches(batches, &mut uploads);
                }
                _ = gc.tick() => {
                    self.context
                        .cache
                        .lock()
                        .collect_garbage(SystemTime::now(), Instant::now());
                    self.prune_backoff();
                }
                Some(finished) = uploads.join_next(), if !uploads.is_empty() => {
                    match finished {
                        Ok(finished) => self.finish_upload(finished),
                        Err(e) if e.is_panic() => tracing::error!("upload task panicked: {e}"),
                        Err(_) => {}
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(DeliveryCommand::SendReportsForSource(source, ack)) => {
                        let batches = self.context.cache.lock().get_reports_for_source(source);
                        self.dispatch_batches(batches, &mut uploads);
                        let _ = ack.send(());
                    }
                    Some(DeliveryCommand::Shutdown(ack)) => {
                        uploads.abort_all();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        uploads.abort_all();
                        break;
                    }
                },
            }
        }
    }

    fn dispatch_batches(
        &mut self,
        batches: Vec<DeliveryBatch>,
        uploads: &mut JoinSet<FinishedUpload>,
    ) {
        let now_wall = SystemTime::now();
        let now = Instant::now();

        for batch in batches {
            let dispatch = {
                let mut cache = self.context.cache.lock();
                let Some((group_key, endpoints)) =
                    cache.find_group_for_delivery(&batch.group_key, now_wall)
                else {
                    continue;
                };
                if self.in_flight.contains(&group_key) {
                    continue;
                }
                let Some(endpoint) = self.choose_endpoint(&endpoints, now) else {
                    continue;
                };

                let mut ids = batch.report_ids.clone();
                ids.sort_by_key(|id| (cache.get_report(*id).map(|r| r.queued), *id));
                let payload = build_payload(&cache, &ids, now);
                if payload.is_empty() {
                    continue;
                }
                let payload = match serde_json::to_vec(&payload) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        tracing::error!(error = %e, "could not serialize report batch");
                        continue;
                    }
                };

                cache.mark_pending(&ids);
                cache.increment_attempts(&ids);
                cache.mark_endpoint_pending(&group_key, &endpoint.url, true);
                (group_key, endpoint.url, ids, payload)
            };

            let (group_key, endpoint_url, ids, payload) = dispatch;
            self.in_flight.insert(group_key.clone());

            let uploader = self.context.uploader.clone();
            let partition: PartitionKey = batch.group_key.partition.clone();
            uploads.spawn(async move {
                let outcome = uploader
                    .upload(endpoint_url.clone(), payload, &partition)
                    .await;
                FinishedUpload {
                    group_key,
                    endpoint: endpoint_url,
                    report_ids: ids,
                    outcome,
                }
            });
        }
    }

    /// Weighted random pick within the best priority band of the endpoints
    /// that are not backing off.
    fn choose_endpoint(&self, endpoints: &[Endpoint], now: Instant) -> Option<Endpoint> {
        let eligible: Vec<&Endpoint> = endpoints
            .iter()
            .filter(|e| {
                self.backoff
                    .get(&e.url)
                    .is_none_or(|b| b.next_eligible <= now)
            })
            .collect();
        let best = eligible.iter().map(|e| e.priority).min()?;
        let band: Vec<&Endpoint> = eligible
            .into_iter()
            .filter(|e| e.priority == best)
            .collect();

        let total: u64 = band.iter().map(|e| u64::from(e.weight)).sum();
        if band.len() == 1 || total == 0 {
            return band.first().map(|e| (*e).clone());
        }
        let mut roll = rand::thread_rng().gen_range(0..total);
        for endpoint in band {
            let weight = u64::from(endpoint.weight);
            if roll < weight {
                return Some(endpoint.clone());
            }
            roll -= weight;
        }
        None
    }

    fn finish_upload(&mut self, finished: FinishedUpload) {
        self.in_flight.remove(&finished.group_key);
        metrics::counter!(UPLOAD_OUTCOME.name, "outcome" => finished.outcome.as_str())
            .increment(1);

        let policy = &self.context.policy;
        let mut cache = self.context.cache.lock();
        cache.mark_endpoint_pending(&finished.group_key, &finished.endpoint, false);

        match finished.outcome {
            UploadOutcome::Success => {
                cache.record_delivery_success(
                    &finished.group_key,
                    &finished.endpoint,
                    SystemTime::now(),
                );
                cache.remove_reports(&finished.report_ids);
                self.backoff.remove(&finished.endpoint);
            }
            UploadOutcome::RemoveEndpoint => {
                tracing::debug!(endpoint = %finished.endpoint, "collector gone, removing endpoint");
                cache.remove_endpoint(&finished.group_key, &finished.endpoint);
                cache.clear_pending(&finished.report_ids);
                self.backoff.remove(&finished.endpoint);
            }
            UploadOutcome::Failure => {
                cache.record_delivery_failure(&finished.group_key, &finished.endpoint);

                let (exhausted, retry): (Vec<ReportId>, Vec<ReportId>) =
                    finished.report_ids.iter().partition(|id| {
                        cache
                            .get_report(**id)
                            .is_some_and(|r| r.attempts >= policy.max_report_attempts)
                    });
                if !exhausted.is_empty() {
                    tracing::warn!(
                        endpoint = %finished.endpoint,
                        count = exhausted.len(),
                        "giving up on reports after repeated upload failures"
                    );
                    cache.remove_reports(&exhausted);
                }
                cache.clear_pending(&retry);

                let now = Instant::now();
                let entry = self
                    .backoff
                    .entry(finished.endpoint.clone())
                    .or_insert(EndpointBackoff {
                        consecutive_failures: 0,
                        next_eligible: now,
                    });
                entry.consecutive_failures += 1;
                let exponent = entry.consecutive_failures.saturating_sub(1).min(16);
                let delay = std::cmp::min(
                    policy.endpoint_backoff_initial() * 2u32.pow(exponent),
                    policy.endpoint_backoff_max(),
                );
                entry.next_eligible = now + delay;
            }
        }
    }

    /// Forgets backoff state for endpoints that have been quiet for a full
    /// backoff ceiling past their window.
    fn prune_backoff(&mut self) {
        let now = Instant::now();
        let ceiling = self.context.policy.endpoint_backoff_max();
        self.backoff
            .retain(|_, b| b.next_eligible + ceiling > now);
    }
}

/// The upload payload: one `{age, type, url, user_agent, body}` object per
/// report, `age` in milliseconds since the report was queued.
fn build_payload(cache: &crate::cache::ReportingCache, ids: &[ReportId], now: Instant) -> Vec<Value> {
    ids.iter()
        .filter_map(|id| cache.get_report(*id))
        .map(|report| {
            json!({
                "age": now.duration_since(report.queued).as_millis() as u64,
                "type": report.report_type,
                "url": report.url.as_str(),
                "user_agent": report.user_agent,
                "body": report.body,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReportingPolicy;
    use crate::testutils::{MockUploader, settle, test_context, url};
    use crate::types::{Expiry, ReportStatus};
    use std::time::Duration;
    use uuid::Uuid;

    fn fast_policy() -> ReportingPolicy {
        ReportingPolicy {
            delivery_interval_secs: 60,
            endpoint_backoff_initial_secs: 90,
            ..ReportingPolicy::default()
        }
    }

    fn spawn_agent(context: &Arc<ReportingContext>) -> mpsc::Sender<DeliveryCommand> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(DeliveryAgent::new(context.clone()).run(rx));
        tx
    }

    fn set_group(context: &Arc<ReportingContext>, origin: &str, name: &str, endpoints: &[(&str, u32)]) {
        let endpoints = endpoints
            .iter()
            .map(|(e, priority)| Endpoint::new(url(e), *priority, 1))
            .collect();
        context.cache.lock().set_endpoints_for_origin(
            PartitionKey::empty(),
            url(origin),
            name.into(),
            false,
            Expiry::At(SystemTime::now() + Duration::from_secs(3600)),
            endpoints,
        );
    }

    fn queue(context: &Arc<ReportingContext>, origin: &str, group: &str) -> ReportId {
        context.cache.lock().add_report(
            None,
            PartitionKey::empty(),
            url(origin),
            "ua".into(),
            group.into(),
            "t".into(),
            json!({"k": "v"}),
            0,
            Instant::now(),
            0,
        )
    }

    fn report_count(context: &Arc<ReportingContext>) -> usize {
        context.cache.lock().report_count()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_queued_reports_on_tick() {
        let uploader = MockUploader::new();
        let context = test_context(fast_policy(), uploader.clone());
        let _tx = spawn_agent(&context);

        set_group(&context, "https://a.test", "g", &[("https://r.test/up", 1)]);
        queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(59)).await;
        settle().await;
        assert!(uploader.uploads().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        let uploads = uploader.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].endpoint.as_str(), "https://r.test/up");

        let payload = uploads[0].payload.as_array().unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0]["url"], "https://a.test/");
        assert_eq!(payload[0]["type"], "t");
        assert_eq!(payload[0]["user_agent"], "ua");
        assert_eq!(payload[0]["body"], json!({"k": "v"}));
        assert!(payload[0]["age"].is_u64());

        // delivered reports are gone and never uploaded again
        assert_eq!(report_count(&context), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_updates_endpoint_stats() {
        let uploader = MockUploader::new();
        let context = test_context(fast_policy(), uploader.clone());
        let _tx = spawn_agent(&context);

        set_group(&context, "https://a.test", "g", &[("https://r.test/up", 1)]);
        queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        let cache = context.cache.lock();
        let group = cache
            .get_endpoint_group(&PartitionKey::empty(), &url("https://a.test"), "g")
            .unwrap();
        assert_eq!(group.endpoints[0].stats.successful_uploads, 1);
        assert!(!group.endpoints[0].pending_upload);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_requeues_with_backoff() {
        let uploader = MockUploader::new();
        uploader.push_outcome(UploadOutcome::Failure);
        let context = test_context(fast_policy(), uploader.clone());
        let _tx = spawn_agent(&context);

        set_group(&context, "https://a.test", "g", &[("https://r.test/up", 1)]);
        let id = queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 1);
        {
            let cache = context.cache.lock();
            let report = cache.get_report(id).expect("report requeued");
            assert_eq!(report.status, ReportStatus::Queued);
            assert_eq!(report.attempts, 1);
        }

        // endpoint is backing off (90s), so the 120s tick skips the batch
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 1);

        // by the 180s tick the backoff window has elapsed
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 2);
        assert_eq!(report_count(&context), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_are_dropped_after_max_attempts() {
        let uploader = MockUploader::new();
        let policy = ReportingPolicy {
            max_report_attempts: 2,
            endpoint_backoff_initial_secs: 1,
            ..fast_policy()
        };
        for _ in 0..3 {
            uploader.push_outcome(UploadOutcome::Failure);
        }
        let context = test_context(policy, uploader.clone());
        let _tx = spawn_agent(&context);

        set_group(&context, "https://a.test", "g", &[("https://r.test/up", 1)]);
        let id = queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        // one failure short of the cap: still queued
        assert!(context.cache.lock().get_report(id).is_some());

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 2);
        assert_eq!(report_count(&context), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_endpoint_is_removed_and_next_priority_takes_over() {
        let uploader = MockUploader::new();
        uploader.push_outcome(UploadOutcome::RemoveEndpoint);
        let context = test_context(fast_policy(), uploader.clone());
        let _tx = spawn_agent(&context);

        set_group(
            &context,
            "https://a.test",
            "g",
            &[("https://r.test/e1", 1), ("https://r.test/e2", 2)],
        );
        queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;

        let uploads = uploader.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].endpoint.as_str(), "https://r.test/e1");
        assert_eq!(uploads[1].endpoint.as_str(), "https://r.test/e2");
        assert_eq!(report_count(&context), 0);

        let cache = context.cache.lock();
        let group = cache
            .get_endpoint_group(&PartitionKey::empty(), &url("https://a.test"), "g")
            .unwrap();
        assert_eq!(group.endpoints.len(), 1);
        assert_eq!(group.endpoints[0].url.as_str(), "https://r.test/e2");
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_upload_in_flight_per_group() {
        let uploader = MockUploader::with_delay(Duration::from_secs(120));
        let context = test_context(fast_policy(), uploader.clone());
        let _tx = spawn_agent(&context);

        set_group(&context, "https://a.test", "g", &[("https://r.test/up", 1)]);
        queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        queue(&context, "https://a.test", "g");

        // the 120s tick happens while the first upload is still in flight
        tokio::time::sleep(Duration::from_secs(69)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 1);

        // first upload lands at 181s, the 240s tick dispatches the second
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(report_count(&context), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_reports_for_source_bypasses_the_cadence() {
        let uploader = MockUploader::new();
        let context = test_context(fast_policy(), uploader.clone());
        let tx = spawn_agent(&context);

        let source = Uuid::new_v4();
        {
            let mut cache = context.cache.lock();
            cache.set_document_endpoints(
                source,
                crate::IsolationInfo::empty(),
                PartitionKey::empty(),
                url("https://a.test"),
                vec![("g".into(), url("https://r.test/v1"))],
            );
            for _ in 0..2 {
                cache.add_report(
                    Some(source),
                    PartitionKey::empty(),
                    url("https://a.test"),
                    "ua".into(),
                    "g".into(),
                    "t".into(),
                    json!({}),
                    0,
                    Instant::now(),
                    0,
                );
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(DeliveryCommand::SendReportsForSource(source, ack_tx))
            .await
            .unwrap();
        ack_rx.await.unwrap();
        settle().await;

        let uploads = uploader.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].endpoint.as_str(), "https://r.test/v1");
        assert_eq!(uploads[0].payload.as_array().unwrap().len(), 2);
        assert_eq!(report_count(&context), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_in_flight_uploads() {
        let uploader = MockUploader::with_delay(Duration::from_secs(300));
        let context = test_context(fast_policy(), uploader.clone());
        let tx = spawn_agent(&context);

        set_group(&context, "https://a.test", "g", &[("https://r.test/up", 1)]);
        let id = queue(&context, "https://a.test", "g");

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(uploader.uploads().len(), 1);

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(DeliveryCommand::Shutdown(ack_tx)).await.unwrap();
        ack_rx.await.unwrap();

        // the completion is absorbed: the report stays pending forever
        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        let cache = context.cache.lock();
        assert_eq!(cache.get_report(id).unwrap().status, ReportStatus::Pending);
    }
}
