use crate::models::{ClientContext, MetricAggregate, MetricSample};
use crate::services::engine::AnalyticsError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Longest accepted metric name.
pub const MAX_METRIC_NAME_LEN: usize = 64;

fn invalid(index: usize, reason: &str) -> AnalyticsError {
    AnalyticsError::Validation(format!("metrics[{}]: {}", index, reason))
}

fn parse_timestamp(index: usize, raw: &Value) -> Result<DateTime<Utc>, AnalyticsError> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|ms| ms as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| invalid(index, "timestamp is out of range")),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| invalid(index, "timestamp must be epoch milliseconds or RFC 3339")),
        _ => Err(invalid(
            index,
            "timestamp must be epoch milliseconds or RFC 3339",
        )),
    }
}

/// Parse an ingestion body `{"metrics": [...]}` into samples tagged with the
/// request context.
pub fn parse_samples(
    body: &Value,
    context: &ClientContext,
    received_at: DateTime<Utc>,
) -> Result<Vec<MetricSample>, AnalyticsError> {
    let entries = body
        .get("metrics")
        .and_then(Value::as_array)
        .ok_or_else(|| AnalyticsError::Validation("metrics must be an array".into()))?;
    if entries.is_empty() {
        return Err(AnalyticsError::Validation(
            "metrics must contain at least one sample".into(),
        ));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| invalid(index, "name must be a non-empty string"))?;
            if name.len() > MAX_METRIC_NAME_LEN {
                return Err(invalid(index, "name is too long"));
            }
            let value = entry
                .get("value")
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .ok_or_else(|| invalid(index, "value must be a finite number"))?;
            let timestamp = match entry.get("timestamp") {
                None | Some(Value::Null) => received_at,
                Some(raw) => parse_timestamp(index, raw)?,
            };

            let mut sample_context = context.clone();
            if sample_context.session_id.is_none() {
                sample_context.session_id = entry
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }

            Ok(MetricSample {
                name: name.to_string(),
                value,
                timestamp,
                context: sample_context,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshotResponse {
    pub metric_count: usize,
    pub metrics: BTreeMap<String, MetricAggregate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn parses_samples_with_timestamps_and_session_fallback() {
        let body = json!({
            "metrics": [
                { "name": "memory_used", "value": 42.5, "timestamp": 1_767_225_600_000i64 },
                { "name": "long_task_duration", "value": 12, "session_id": "s-1",
                  "timestamp": "2026-01-01T00:00:00Z" },
                { "name": "resource_load_time", "value": 800 }
            ]
        });

        let samples = parse_samples(&body, &ClientContext::default(), now()).unwrap();

        assert_eq!(samples.len(), 3);
        assert_eq!(
            samples[0].timestamp,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(samples[0].timestamp, samples[1].timestamp);
        assert_eq!(samples[1].context.session_id.as_deref(), Some("s-1"));
        assert_eq!(samples[1].value, 12.0);
        assert_eq!(samples[2].timestamp, now());
    }

    #[test]
    fn header_session_wins_over_sample_session() {
        let body = json!({ "metrics": [{ "name": "m", "value": 1, "session_id": "body" }] });
        let context = ClientContext {
            session_id: Some("header".into()),
            ..Default::default()
        };

        let samples = parse_samples(&body, &context, now()).unwrap();
        assert_eq!(samples[0].context.session_id.as_deref(), Some("header"));
    }

    #[test]
    fn rejects_malformed_batches() {
        let context = ClientContext::default();
        let reject = |body: Value| parse_samples(&body, &context, now()).is_err();

        assert!(reject(json!({})));
        assert!(reject(json!({ "metrics": "memory_used" })));
        assert!(reject(json!({ "metrics": [] })));
        assert!(reject(json!({ "metrics": [{ "name": "m", "value": "fast" }] })));
        assert!(reject(json!({ "metrics": [{ "value": 1 }] })));
        assert!(reject(json!({ "metrics": [{ "name": "m", "value": 1, "timestamp": true }] })));
        let long_name = "m".repeat(MAX_METRIC_NAME_LEN + 1);
        assert!(reject(json!({ "metrics": [{ "name": long_name, "value": 1 }] })));
        let longest = "m".repeat(MAX_METRIC_NAME_LEN);
        assert!(!reject(json!({ "metrics": [{ "name": longest, "value": 1 }] })));
    }
}
