//! Client performance-metric rollup and anomaly detection.

use crate::models::{MetricAggregate, MetricSample};
use crate::services::engine::AnalyticsError;
use crate::services::metrics::{ANOMALIES_TOTAL, METRIC_SAMPLES_TOTAL};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Minimum recent-window length before trend checks run.
pub const TREND_MIN_SAMPLES: usize = 5;
pub const MEMORY_SLOPE_LIMIT: f64 = 5.0;
pub const DEGRADATION_FACTOR: f64 = 1.5;
/// Distinct metric names the registry tracks. Later names are counted but
/// not aggregated.
pub const MAX_TRACKED_METRICS: usize = 256;
/// Prometheus label for client metric names without a threshold.
pub const OTHER_METRIC_LABEL: &str = "other";

const MEMORY_METRIC: &str = "memory_used";
const API_METRIC: &str = "api_request_duration";

/// Maximum acceptable average per metric name.
const THRESHOLDS: [(&str, f64); 4] = [
    ("api_request_duration", 2000.0), // ms
    ("resource_load_time", 3000.0),   // ms
    ("memory_used", 100.0),           // MB
    ("long_task_duration", 50.0),     // ms
];

pub fn threshold_for(name: &str) -> Option<f64> {
    THRESHOLDS
        .iter()
        .find(|(metric, _)| *metric == name)
        .map(|(_, limit)| *limit)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalySignal {
    ThresholdExceeded {
        metric: String,
        average: f64,
        threshold: f64,
    },
    MemoryTrend {
        metric: String,
        slope: f64,
    },
    PerformanceDegradation {
        metric: String,
        recent_average: f64,
        lifetime_average: f64,
    },
}

impl AnomalySignal {
    pub fn metric(&self) -> &str {
        match self {
            AnomalySignal::ThresholdExceeded { metric, .. }
            | AnomalySignal::MemoryTrend { metric, .. }
            | AnomalySignal::PerformanceDegradation { metric, .. } => metric,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnomalySignal::ThresholdExceeded { .. } => "threshold_exceeded",
            AnomalySignal::MemoryTrend { .. } => "memory_trend",
            AnomalySignal::PerformanceDegradation { .. } => "performance_degradation",
        }
    }
}

/// Label value for a client-supplied metric name. Only known names become
/// their own series.
pub fn metric_label(name: &str) -> &str {
    if threshold_for(name).is_some() {
        name
    } else {
        OTHER_METRIC_LABEL
    }
}

/// Ordinary least squares slope of `values` against their index.
/// Returns 0 for fewer than two points.
pub fn trend_slope(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if values.len() < 2 {
        return 0.0;
    }
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

/// Fold a batch into per-name aggregates in arrival order.
pub fn fold_batch(samples: &[MetricSample]) -> BTreeMap<String, MetricAggregate> {
    let mut aggregates: BTreeMap<String, MetricAggregate> = BTreeMap::new();
    for sample in samples {
        aggregates
            .entry(sample.name.clone())
            .or_default()
            .fold(sample.value);
    }
    aggregates
}

/// Advisory checks over folded aggregates. Never fails.
pub fn detect_anomalies(aggregates: &BTreeMap<String, MetricAggregate>) -> Vec<AnomalySignal> {
    let mut signals = Vec::new();

    for (name, aggregate) in aggregates {
        if let Some(threshold) = threshold_for(name) {
            if aggregate.average > threshold {
                signals.push(AnomalySignal::ThresholdExceeded {
                    metric: name.clone(),
                    average: aggregate.average,
                    threshold,
                });
            }
        }
    }

    if let Some(memory) = aggregates.get(MEMORY_METRIC) {
        if memory.recent.len() >= TREND_MIN_SAMPLES {
            let slope = trend_slope(&memory.recent_values());
            if slope > MEMORY_SLOPE_LIMIT {
                signals.push(AnomalySignal::MemoryTrend {
                    metric: MEMORY_METRIC.to_string(),
                    slope,
                });
            }
        }
    }

    if let Some(api) = aggregates.get(API_METRIC) {
        if api.recent.len() >= TREND_MIN_SAMPLES {
            let recent_average = api.recent_average();
            if recent_average > api.average * DEGRADATION_FACTOR {
                signals.push(AnomalySignal::PerformanceDegradation {
                    metric: API_METRIC.to_string(),
                    recent_average,
                    lifetime_average: api.average,
                });
            }
        }
    }

    for signal in &signals {
        match signal {
            AnomalySignal::ThresholdExceeded {
                metric,
                average,
                threshold,
            } => tracing::warn!(metric = %metric, average, threshold, "Performance threshold exceeded"),
            AnomalySignal::MemoryTrend { metric, slope } => {
                tracing::warn!(metric = %metric, slope, "Potential memory leak detected")
            }
            AnomalySignal::PerformanceDegradation {
                metric,
                recent_average,
                lifetime_average,
            } => tracing::warn!(
                metric = %metric,
                recent_average,
                lifetime_average,
                "API performance degradation detected"
            ),
        }
        ANOMALIES_TOTAL
            .with_label_values(&[metric_label(signal.metric()), signal.kind()])
            .inc();
    }

    signals
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub processed_count: usize,
    pub aggregated_metric_count: usize,
    /// Names in the batch the registry had no room for.
    pub untracked_metric_count: usize,
    pub anomalies: Vec<AnomalySignal>,
}

/// Process-wide aggregate table, bounded to `capacity` distinct names.
/// DashMap entry guards give one writer per metric name at a time.
#[derive(Clone)]
pub struct MetricsRegistry {
    aggregates: Arc<DashMap<String, MetricAggregate>>,
    capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_METRICS)
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            aggregates: Arc::new(DashMap::new()),
            capacity,
        }
    }

    #[tracing::instrument(skip(self, samples), fields(batch_size = samples.len()))]
    pub fn ingest(&self, samples: Vec<MetricSample>) -> Result<IngestOutcome, AnalyticsError> {
        if samples.is_empty() {
            return Err(AnalyticsError::Validation(
                "metrics batch must contain at least one sample".into(),
            ));
        }

        for sample in &samples {
            let label = metric_label(&sample.name);
            METRIC_SAMPLES_TOTAL.with_label_values(&[label]).inc();
            metrics::histogram!("client_metric_value", "name" => label.to_string())
                .record(sample.value);
        }

        let batch = fold_batch(&samples);
        let anomalies = detect_anomalies(&batch);

        let mut untracked = 0;
        for (name, aggregate) in &batch {
            if !self.merge(name, aggregate) {
                untracked += 1;
            }
        }
        if untracked > 0 {
            tracing::warn!(
                untracked,
                capacity = self.capacity,
                "Metrics registry full, new metric names not aggregated"
            );
        }

        let context = &samples[0].context;
        tracing::info!(
            processed = samples.len(),
            metrics = batch.len(),
            anomalies = anomalies.len(),
            session_id = context.session_id.as_deref().unwrap_or("-"),
            client_ip = context.client_ip.as_deref().unwrap_or("-"),
            "Client metrics ingested"
        );

        Ok(IngestOutcome {
            processed_count: samples.len(),
            aggregated_metric_count: batch.len(),
            untracked_metric_count: untracked,
            anomalies,
        })
    }

    /// Merge into an existing name, or admit a new one while below capacity.
    fn merge(&self, name: &str, aggregate: &MetricAggregate) -> bool {
        if let Some(mut existing) = self.aggregates.get_mut(name) {
            existing.merge(aggregate);
            return true;
        }
        if self.aggregates.len() >= self.capacity {
            return false;
        }
        self.aggregates
            .entry(name.to_string())
            .or_default()
            .merge(aggregate);
        true
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricAggregate> {
        self.aggregates
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<MetricAggregate> {
        self.aggregates.get(name).map(|entry| entry.value().clone())
    }
}
