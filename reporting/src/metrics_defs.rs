//! Metrics definitions for the reporting core.

pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

pub enum MetricType {
    Counter,
    Histogram,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Histogram => "histogram",
        }
    }
}

pub const REPORTS_QUEUED: MetricDef = MetricDef {
    name: "reports.queued",
    metric_type: MetricType::Counter,
    description: "Number of reports accepted into the cache",
};

pub const REPORTS_DROPPED: MetricDef = MetricDef {
    name: "reports.dropped",
    metric_type: MetricType::Counter,
    description: "Number of reports dropped before queueing, tagged by reason",
};

pub const REPORTS_EVICTED: MetricDef = MetricDef {
    name: "reports.evicted",
    metric_type: MetricType::Counter,
    description: "Number of reports evicted or doomed to respect the report cap",
};

pub const HEADERS_PROCESSED: MetricDef = MetricDef {
    name: "headers.processed",
    metric_type: MetricType::Counter,
    description: "Number of Report-To headers that reached the parser",
};

pub const HEADERS_REJECTED: MetricDef = MetricDef {
    name: "headers.rejected",
    metric_type: MetricType::Counter,
    description: "Number of Report-To headers dropped before parsing, tagged by reason",
};

pub const UPLOAD_OUTCOME: MetricDef = MetricDef {
    name: "upload.outcome",
    metric_type: MetricType::Counter,
    description: "Upload completions, tagged by outcome",
};

pub const UPLOAD_DURATION: MetricDef = MetricDef {
    name: "upload.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete one upload in seconds",
};

// TODO: all metrics must be added here for now, this can be done dynamically
// with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    REPORTS_QUEUED,
    REPORTS_DROPPED,
    REPORTS_EVICTED,
    HEADERS_PROCESSED,
    HEADERS_REJECTED,
    UPLOAD_OUTCOME,
    UPLOAD_DURATION,
];
