//! Per-operation success and failure counters.
//!
//! Every exposed operation opens a [`MetricContext`] and closes it with the
//! outcome. Outcomes land in a prometheus [`Registry`] as
//! `vmset_operations_total{operation, result}` and
//! `vmset_operation_duration_seconds{operation}`.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Instant;

use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

const NAMESPACE: &str = "vmset";
const OPERATIONS_TOTAL: &str = "vmset_operations_total";

const OPERATION: &str = "operation";
const RESULT: &str = "result";
const SUCCEEDED: &str = "succeeded";
const FAILED: &str = "failed";

static OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    match IntCounterVec::new(
        Opts::new("operations_total", "Operations by outcome").namespace(NAMESPACE),
        &[OPERATION, RESULT],
    ) {
        Ok(counter) => counter,
        Err(e) => panic!("Failed to create metric 'operations_total': {e}"),
    }
});

static LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    match HistogramVec::new(
        HistogramOpts::new("operation_duration_seconds", "Operation latency").namespace(NAMESPACE),
        &[OPERATION],
    ) {
        Ok(histogram) => histogram,
        Err(e) => panic!("Failed to create metric 'operation_duration_seconds': {e}"),
    }
});

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let registry = Registry::new();
    register(&registry, OPERATIONS.clone());
    register(&registry, LATENCY.clone());
    registry
});

fn register<T: Collector + 'static>(registry: &Registry, collector: T) {
    if let Err(e) = registry.register(Box::new(collector)) {
        panic!("Failed to register collector: {e}");
    }
}

/// The registry holding every vmset metric.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub succeeded: u64,
    pub failed: u64,
}

/// Tracks one invocation of an operation.
#[must_use = "call observe() to record the outcome"]
pub struct MetricContext {
    operation: &'static str,
    resource_group: String,
    service: String,
    started: Instant,
}

impl MetricContext {
    pub fn new(operation: &'static str, resource_group: &str, service: &str) -> Self {
        Self {
            operation,
            resource_group: resource_group.to_string(),
            service: service.to_string(),
            started: Instant::now(),
        }
    }

    /// Record the outcome and return it unchanged.
    pub fn observe<T, E: std::fmt::Display>(self, result: Result<T, E>) -> Result<T, E> {
        let elapsed = self.started.elapsed();
        LATENCY
            .with_label_values(&[self.operation])
            .observe(elapsed.as_secs_f64());
        match &result {
            Ok(_) => {
                OPERATIONS.with_label_values(&[self.operation, SUCCEEDED]).inc();
                debug!(
                    operation = self.operation,
                    resource_group = %self.resource_group,
                    service = %self.service,
                    latency_ms = elapsed.as_millis() as u64,
                    "operation succeeded"
                );
            }
            Err(e) => {
                OPERATIONS.with_label_values(&[self.operation, FAILED]).inc();
                warn!(
                    operation = self.operation,
                    resource_group = %self.resource_group,
                    service = %self.service,
                    latency_ms = elapsed.as_millis() as u64,
                    "operation failed: {}",
                    e
                );
            }
        }
        result
    }
}

/// Counts gathered from the registry, per operation, sorted by name.
pub fn snapshot() -> Vec<(String, OperationCounts)> {
    let mut all: BTreeMap<String, OperationCounts> = BTreeMap::new();
    for family in registry().gather() {
        if family.get_name() != OPERATIONS_TOTAL {
            continue;
        }
        for metric in family.get_metric() {
            let mut operation = None;
            let mut outcome = None;
            for pair in metric.get_label() {
                match pair.get_name() {
                    OPERATION => operation = Some(pair.get_value()),
                    RESULT => outcome = Some(pair.get_value()),
                    _ => {}
                }
            }
            let (Some(operation), Some(outcome)) = (operation, outcome) else {
                continue;
            };
            let value = metric.get_counter().get_value() as u64;
            let counts = all.entry(operation.to_string()).or_default();
            match outcome {
                SUCCEEDED => counts.succeeded += value,
                FAILED => counts.failed += value,
                _ => {}
            }
        }
    }
    all.into_iter().collect()
}

/// Counts recorded so far for `operation`.
pub fn operation_counts(operation: &str) -> OperationCounts {
    snapshot()
        .into_iter()
        .find(|(op, _)| op == operation)
        .map(|(_, counts)| counts)
        .unwrap_or_default()
}

/// Every metric in the prometheus text exposition format.
pub fn render() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry().gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
