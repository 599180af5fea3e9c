//! Metrics definitions for the aggregator.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with handler.",
};

pub const PROXY_ERRORS: MetricDef = MetricDef {
    name: "proxy.errors",
    metric_type: MetricType::Counter,
    description: "Proxied requests answered with a gateway error instead of the backend response. Tagged with reason.",
};

pub const DISCOVERY_FETCHES: MetricDef = MetricDef {
    name: "discovery.fetches",
    metric_type: MetricType::Counter,
    description: "Discovery documents requested from backends. Tagged with result.",
};

pub const DISCOVERY_CACHE_HIT: MetricDef = MetricDef {
    name: "discovery.cache.hit",
    metric_type: MetricType::Counter,
    description: "Discovery syncs answered from a fresh cached result",
};

pub const DISCOVERY_STALE: MetricDef = MetricDef {
    name: "discovery.stale",
    metric_type: MetricType::Counter,
    description: "Group versions published as stale after failed fetches",
};

pub const OPENAPI_DOWNLOADS: MetricDef = MetricDef {
    name: "openapi.downloads",
    metric_type: MetricType::Counter,
    description: "OpenAPI documents requested from backends. Tagged with version and result.",
};

pub const OPENAPI_MERGES: MetricDef = MetricDef {
    name: "openapi.merges",
    metric_type: MetricType::Counter,
    description: "Merged OpenAPI documents recomputed. Tagged with version.",
};

pub const AVAILABILITY_TRANSITIONS: MetricDef = MetricDef {
    name: "availability.transitions",
    metric_type: MetricType::Counter,
    description: "Available condition writes. Tagged with status.",
};

pub const UNAVAILABLE_SERVICES: MetricDef = MetricDef {
    name: "availability.unavailable",
    metric_type: MetricType::Gauge,
    description: "Number of records currently not available",
};

pub const WORKQUEUE_DEPTH: MetricDef = MetricDef {
    name: "workqueue.depth",
    metric_type: MetricType::Gauge,
    description: "Keys waiting in a work queue. Tagged with queue.",
};

pub const WORKQUEUE_RETRIES: MetricDef = MetricDef {
    name: "workqueue.retries",
    metric_type: MetricType::Counter,
    description: "Keys requeued with backoff after a failure. Tagged with queue.",
};

pub const AUTOREGISTER_WRITES: MetricDef = MetricDef {
    name: "autoregister.writes",
    metric_type: MetricType::Counter,
    description: "Records written by the auto-register controller. Tagged with action.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    PROXY_ERRORS,
    DISCOVERY_FETCHES,
    DISCOVERY_CACHE_HIT,
    DISCOVERY_STALE,
    OPENAPI_DOWNLOADS,
    OPENAPI_MERGES,
    AVAILABILITY_TRANSITIONS,
    UNAVAILABLE_SERVICES,
    WORKQUEUE_DEPTH,
    WORKQUEUE_RETRIES,
    AUTOREGISTER_WRITES,
];
