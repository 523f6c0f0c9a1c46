//! Prometheus metrics for analytics-service.
//!
//! Service metrics live in the default `prometheus` registry; HTTP request
//! metrics are recorded through the `metrics` facade by the service-core
//! middleware and exported by `metrics-exporter-prometheus`. Both are rendered
//! on `/metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use std::sync::{Once, OnceLock};

static RECORDER_INIT: Once = Once::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Analytics operations by name and outcome.
pub static ANALYTICS_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "analytics_requests_total",
        "Total number of analytics computations",
        &["operation", "status"]
    )
    .expect("Failed to register analytics_requests_total")
});

/// End-to-end duration of an analytics computation.
pub static ANALYTICS_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "analytics_operation_duration_seconds",
        "Analytics computation duration in seconds",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register analytics_operation_duration_seconds")
});

/// Record store query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "analytics_db_query_duration_seconds",
        "Record store query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .expect("Failed to register analytics_db_query_duration_seconds")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "analytics_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register analytics_errors_total")
});

/// Client performance samples ingested, by metric name.
pub static METRIC_SAMPLES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "analytics_client_samples_total",
        "Client performance samples ingested by metric name",
        &["metric"]
    )
    .expect("Failed to register analytics_client_samples_total")
});

/// Advisory anomaly signals raised by the rollup.
pub static ANOMALIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "analytics_anomalies_total",
        "Anomaly signals by metric and kind",
        &["metric", "kind"] // threshold_exceeded, memory_trend, performance_degradation
    )
    .expect("Failed to register analytics_anomalies_total")
});

/// Cache lookups by result.
pub static CACHE_LOOKUPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "analytics_cache_lookups_total",
        "Analytics cache lookups by result",
        &["result"] // hit, miss, error
    )
    .expect("Failed to register analytics_cache_lookups_total")
});

/// Initialize all metrics and install the `metrics` recorder once per process.
pub fn init_metrics() {
    Lazy::force(&ANALYTICS_REQUESTS_TOTAL);
    Lazy::force(&ANALYTICS_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&METRIC_SAMPLES_TOTAL);
    Lazy::force(&ANOMALIES_TOTAL);
    Lazy::force(&CACHE_LOOKUPS_TOTAL);

    RECORDER_INIT.call_once(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = METRICS_HANDLE.set(handle);
        }
        Err(e) => tracing::warn!("Prometheus recorder not installed: {}", e),
    });
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Ok(service_metrics) = encoder.encode_to_string(&metric_families) {
        output.push_str(&service_metrics);
    }
    output
}

/// Record the outcome of an analytics computation.
pub fn record_operation(operation: &str, success: bool, seconds: f64) {
    let status = if success { "ok" } else { "error" };
    ANALYTICS_REQUESTS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    ANALYTICS_DURATION
        .with_label_values(&[operation])
        .observe(seconds);
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
