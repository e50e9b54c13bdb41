use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the dispatcher.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Current number of requests waiting to be dispatched
    pub queued: Gauge,
    /// Number of requests dispatched
    pub dispatched: Counter,
    /// Number of dispatches that delivered a block
    pub succeeded: Counter,
    /// Number of dispatches that were scheduled again
    pub retried: Counter,
    /// Number of dispatches that exhausted their retries
    pub failed: Counter,
    /// Number of dispatches that found the request cancelled
    pub cancelled: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "queued",
            "Current number of requests waiting to be dispatched",
            metrics.queued.clone(),
        );
        context.register(
            "dispatched",
            "Number of requests dispatched",
            metrics.dispatched.clone(),
        );
        context.register(
            "succeeded",
            "Number of dispatches that delivered a block",
            metrics.succeeded.clone(),
        );
        context.register(
            "retried",
            "Number of dispatches that were scheduled again",
            metrics.retried.clone(),
        );
        context.register(
            "failed",
            "Number of dispatches that exhausted their retries",
            metrics.failed.clone(),
        );
        context.register(
            "cancelled",
            "Number of dispatches that found the request cancelled",
            metrics.cancelled.clone(),
        );
        metrics
    }
}
