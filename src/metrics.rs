use axum::http::{Method, StatusCode};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;

/// Service-wide metric handles. One instance is created by the primary and
/// shared by every worker, so the shared registry is already the aggregated
/// cluster view.
pub struct Metrics {
    pub registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_request_duration: Histogram,
    pub http_inflight: IntGauge,
    pub injected_errors: IntCounter,
    pub storage_operations: IntCounterVec,
    pub worker_events: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("backups_http_requests_total", "Completed HTTP requests"),
            &["method", "status"],
        )
        .expect("http_requests metric");
        let http_request_duration = Histogram::with_opts(HistogramOpts::new(
            "backups_http_request_duration_seconds",
            "HTTP request latency",
        ))
        .expect("http_request_duration metric");
        let http_inflight = IntGauge::new(
            "backups_http_inflight_requests",
            "Requests currently being served",
        )
        .expect("http_inflight metric");
        let injected_errors = IntCounter::new(
            "backups_injected_errors_total",
            "Responses produced by fault injection",
        )
        .expect("injected_errors metric");
        let storage_operations = IntCounterVec::new(
            Opts::new("backups_storage_operations_total", "Blob store operations"),
            &["op", "outcome"],
        )
        .expect("storage_operations metric");
        let worker_events = IntCounterVec::new(
            Opts::new("backups_worker_events_total", "Worker pool lifecycle events"),
            &["event"],
        )
        .expect("worker_events metric");

        for collector in [
            Box::new(http_requests.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_request_duration.clone()),
            Box::new(http_inflight.clone()),
            Box::new(injected_errors.clone()),
            Box::new(storage_operations.clone()),
            Box::new(worker_events.clone()),
        ] {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            http_requests,
            http_request_duration,
            http_inflight,
            injected_errors,
            storage_operations,
            worker_events,
        }
    }

    pub fn record_request(&self, method: &Method, status: StatusCode, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[method.as_str(), status.as_str()])
            .inc();
        self.http_request_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_storage(&self, op: &'static str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.storage_operations
            .with_label_values(&[op, outcome])
            .inc();
    }

    pub fn record_worker_event(&self, event: &'static str) {
        self.worker_events.with_label_values(&[event]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_registry() {
        let metrics = Metrics::new();
        metrics.record_request(&Method::GET, StatusCode::OK, Duration::from_millis(12));
        metrics.record_storage("save", true);
        metrics.record_storage("save", false);
        metrics.record_worker_event("spawned");

        let families = metrics.registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"backups_http_requests_total"));
        assert!(names.contains(&"backups_storage_operations_total"));
        assert!(names.contains(&"backups_worker_events_total"));
    }
}
