//! Metrics definitions for the enrichment pipeline.

use shared::metrics_defs::{MetricDef, MetricType};

pub const PIPELINE_RUNS: MetricDef = MetricDef {
    name: "pipeline.runs",
    metric_type: MetricType::Counter,
    description: "Number of pipeline runs, tagged by outcome",
};

pub const PIPELINE_DURATION: MetricDef = MetricDef {
    name: "pipeline.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a pipeline run in seconds",
};

pub const UPSTREAM_FETCH_FAILURES: MetricDef = MetricDef {
    name: "upstream.fetch.failures",
    metric_type: MetricType::Counter,
    description: "Number of failed upstream attempts, tagged by source",
};

pub const RETRY_ATTEMPTS: MetricDef = MetricDef {
    name: "upstream.retries",
    metric_type: MetricType::Counter,
    description: "Number of re-issued upstream requests, tagged by source",
};

pub const FALLBACK_ACTIVATIONS: MetricDef = MetricDef {
    name: "upstream.fallback",
    metric_type: MetricType::Counter,
    description: "Number of times a primary source was exhausted and its fallback used",
};

pub const FANOUT_BATCHES: MetricDef = MetricDef {
    name: "fanout.batches",
    metric_type: MetricType::Counter,
    description: "Number of enrichment batches executed",
};

pub const MERGED_RECORDS: MetricDef = MetricDef {
    name: "merge.records",
    metric_type: MetricType::Histogram,
    description: "Number of records emitted by a merge",
};

pub const ALL_METRICS: &[MetricDef] = &[
    PIPELINE_RUNS,
    PIPELINE_DURATION,
    UPSTREAM_FETCH_FAILURES,
    RETRY_ATTEMPTS,
    FALLBACK_ACTIVATIONS,
    FANOUT_BATCHES,
    MERGED_RECORDS,
];
