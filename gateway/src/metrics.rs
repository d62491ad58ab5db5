//! Prometheus metrics for the edge gateway.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    pub static ref HTTP_REQUESTS_IN_FLIGHT: IntGauge = IntGauge::new(
        "http_requests_in_flight",
        "Number of HTTP requests currently being processed"
    ).expect("metric can be created");

    // Edge filter metrics
    pub static ref AUTH_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("auth_failures_total", "Total authentication and authorization failures"),
        &["reason"]
    ).expect("metric can be created");

    pub static ref BLACKLIST_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blacklist_hits_total", "Requests rejected by the blacklist"),
        &["scope"]
    ).expect("metric can be created");

    pub static ref RATE_LIMIT_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_rejections_total", "Requests rejected by the token bucket"),
        &["strategy"]
    ).expect("metric can be created");

    pub static ref STORE_FAIL_OPEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("store_fail_open_total", "Requests admitted because the store could not answer"),
        &["stage"]
    ).expect("metric can be created");

    // Store metrics
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("store_errors_total", "Shared store calls that failed after retry"),
        &["operation", "kind"]
    ).expect("metric can be created");

    // Upstream metrics
    pub static ref UPSTREAM_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "upstream_request_duration_seconds",
            "Time spent waiting on backend services"
        ).buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["upstream", "status"]
    ).expect("metric can be created");
}

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS_TOTAL.clone()),
            Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
            Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()),
            Box::new(AUTH_FAILURES_TOTAL.clone()),
            Box::new(BLACKLIST_HITS_TOTAL.clone()),
            Box::new(RATE_LIMIT_REJECTIONS_TOTAL.clone()),
            Box::new(STORE_FAIL_OPEN_TOTAL.clone()),
            Box::new(STORE_ERRORS_TOTAL.clone()),
            Box::new(UPSTREAM_REQUEST_DURATION_SECONDS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric");
            }
        }
    });
}

/// Encode metrics in Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, endpoint])
        .observe(duration_secs);
}

pub fn record_auth_failure(reason: &str) {
    AUTH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_blacklist_hit(scope: &str) {
    BLACKLIST_HITS_TOTAL.with_label_values(&[scope]).inc();
}

pub fn record_rate_limited(strategy: &str) {
    RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&[strategy]).inc();
}

pub fn record_fail_open(stage: &str) {
    STORE_FAIL_OPEN_TOTAL.with_label_values(&[stage]).inc();
}

pub fn record_store_error(operation: &str, kind: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[operation, kind]).inc();
}

pub fn record_upstream(upstream: &str, status: &str, duration_secs: f64) {
    UPSTREAM_REQUEST_DURATION_SECONDS
        .with_label_values(&[upstream, status])
        .observe(duration_secs);
}
