//! Client performance samples and their per-name rollups.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Number of trailing values kept per metric for trend detection.
pub const RECENT_WINDOW: usize = 10;

/// Request-level context attached to every sample of a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientContext {
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
}

/// A single client-emitted measurement.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub context: ClientContext,
}

/// Running statistics for one metric name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricAggregate {
    pub count: u64,
    pub sum: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub recent: VecDeque<f64>,
}

impl Default for MetricAggregate {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            average: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            recent: VecDeque::with_capacity(RECENT_WINDOW + 1),
        }
    }
}

impl MetricAggregate {
    pub fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.recent.push_back(value);
        while self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.average = self.sum / self.count as f64;
    }

    /// Merge a later batch into this aggregate. The recent window continues
    /// in arrival order.
    pub fn merge(&mut self, later: &MetricAggregate) {
        if later.count == 0 {
            return;
        }
        self.count += later.count;
        self.sum += later.sum;
        self.min = self.min.min(later.min);
        self.max = self.max.max(later.max);
        self.recent.extend(later.recent.iter().copied());
        while self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.average = self.sum / self.count as f64;
    }

    pub fn recent_values(&self) -> Vec<f64> {
        self.recent.iter().copied().collect()
    }

    /// Mean of the recent window only (0 when empty).
    pub fn recent_average(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().sum::<f64>() / self.recent.len() as f64
        }
    }
}
