use serde::Deserialize;
use std::time::Duration;

/// Immutable tunable limits for the reporting core.
///
/// Deserializes with per-field defaults so a config file only has to name
/// the knobs it changes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReportingPolicy {
    /// Global cap on queued reports; eviction is oldest-first.
    pub max_report_count: usize,
    /// Reports older than this are garbage collected undelivered.
    pub max_report_age_secs: u64,
    /// Upload failures after which a report is dropped.
    pub max_report_attempts: usize,
    /// Cap on endpoint groups per origin and endpoints per group.
    pub max_endpoints_per_origin: usize,
    /// Global cap on endpoints across all groups.
    pub max_endpoint_count: usize,
    /// Expired groups are retained this long before garbage collection.
    pub max_group_staleness_secs: u64,
    /// Period of the delivery tick.
    pub delivery_interval_secs: u64,
    /// Period of the garbage collection tick.
    pub garbage_collection_interval_secs: u64,
    /// First retry delay after an endpoint failure; doubles per consecutive
    /// failure.
    pub endpoint_backoff_initial_secs: u64,
    /// Ceiling for the exponential endpoint backoff.
    pub endpoint_backoff_max_secs: u64,
    pub persist_reports_across_restarts: bool,
    pub persist_clients_across_network_changes: bool,
}

impl Default for ReportingPolicy {
    fn default() -> Self {
        ReportingPolicy {
            max_report_count: 100,
            max_report_age_secs: 24 * 60 * 60,
            max_report_attempts: 5,
            max_endpoints_per_origin: 40,
            max_endpoint_count: 1000,
            max_group_staleness_secs: 7 * 24 * 60 * 60,
            delivery_interval_secs: 60,
            garbage_collection_interval_secs: 5 * 60,
            endpoint_backoff_initial_secs: 60,
            endpoint_backoff_max_secs: 60 * 60,
            persist_reports_across_restarts: false,
            persist_clients_across_network_changes: false,
        }
    }
}

impl ReportingPolicy {
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_secs(self.delivery_interval_secs)
    }

    pub fn garbage_collection_interval(&self) -> Duration {
        Duration::from_secs(self.garbage_collection_interval_secs)
    }

    pub fn max_report_age(&self) -> Duration {
        Duration::from_secs(self.max_report_age_secs)
    }

    pub fn max_group_staleness(&self) -> Duration {
        Duration::from_secs(self.max_group_staleness_secs)
    }

    pub fn endpoint_backoff_initial(&self) -> Duration {
        Duration::from_secs(self.endpoint_backoff_initial_secs)
    }

    pub fn endpoint_backoff_max(&self) -> Duration {
        Duration::from_secs(self.endpoint_backoff_max_secs)
    }
}

/// Construction-time service configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub policy: ReportingPolicy,
    /// When false, every inbound partition key is collapsed to the empty
    /// key before any component sees it.
    pub respect_partition_key: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            policy: ReportingPolicy::default(),
            respect_partition_key: true,
        }
    }
}
