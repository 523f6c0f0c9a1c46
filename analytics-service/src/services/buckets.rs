//! Bucketing rules and zero-safe ratios shared by the engine and the stores.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;

pub const MS_PER_DAY: f64 = 86_400_000.0;

/// Fractional days from `earlier` to `later` (negative when `later` precedes).
pub fn days_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / MS_PER_DAY
}

/// `part / whole * 100`, or 0 when `whole` is not positive.
pub fn percentage(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

/// Period-over-period change in percent, 0 when there is no previous value.
pub fn growth_rate(current: f64, previous: f64) -> f64 {
    if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    }
}

pub fn mean(sum: f64, count: u64) -> f64 {
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

/// Overdue aging bucket. Upper edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AgingBucket {
    #[serde(rename = "1-30 days")]
    UpTo30,
    #[serde(rename = "31-60 days")]
    UpTo60,
    #[serde(rename = "61-90 days")]
    UpTo90,
    #[serde(rename = "90+ days")]
    Over90,
}

impl AgingBucket {
    pub const ALL: [AgingBucket; 4] = [
        AgingBucket::UpTo30,
        AgingBucket::UpTo60,
        AgingBucket::UpTo90,
        AgingBucket::Over90,
    ];

    pub fn for_days(days_overdue: f64) -> Self {
        if days_overdue <= 30.0 {
            AgingBucket::UpTo30
        } else if days_overdue <= 60.0 {
            AgingBucket::UpTo60
        } else if days_overdue <= 90.0 {
            AgingBucket::UpTo90
        } else {
            AgingBucket::Over90
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgingBucket::UpTo30 => "1-30 days",
            AgingBucket::UpTo60 => "31-60 days",
            AgingBucket::UpTo90 => "61-90 days",
            AgingBucket::Over90 => "90+ days",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.label() == label)
    }
}

/// Payment delay bucket relative to the due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DelayBucket {
    #[serde(rename = "On Time")]
    OnTime,
    #[serde(rename = "1-7 days late")]
    UpTo7,
    #[serde(rename = "8-30 days late")]
    UpTo30,
    #[serde(rename = "30+ days late")]
    Over30,
}

impl DelayBucket {
    pub const ALL: [DelayBucket; 4] = [
        DelayBucket::OnTime,
        DelayBucket::UpTo7,
        DelayBucket::UpTo30,
        DelayBucket::Over30,
    ];

    pub fn for_delay(delay_days: f64) -> Self {
        if delay_days <= 0.0 {
            DelayBucket::OnTime
        } else if delay_days <= 7.0 {
            DelayBucket::UpTo7
        } else if delay_days <= 30.0 {
            DelayBucket::UpTo30
        } else {
            DelayBucket::Over30
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DelayBucket::OnTime => "On Time",
            DelayBucket::UpTo7 => "1-7 days late",
            DelayBucket::UpTo30 => "8-30 days late",
            DelayBucket::Over30 => "30+ days late",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.label() == label)
    }
}

/// Calendar quarter (1-4) of a month (1-12).
pub fn quarter_of_month(month: u32) -> u32 {
    (month - 1) / 3 + 1
}

/// Grouping tuple for time series. Field order is the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CalendarKey {
    pub year: i32,
    pub month: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
}

impl CalendarKey {
    pub fn month(instant: DateTime<Utc>) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
            week: None,
            day: None,
        }
    }

    pub fn week(instant: DateTime<Utc>) -> Self {
        Self {
            week: Some(instant.iso_week().week()),
            ..Self::month(instant)
        }
    }

    pub fn day(instant: DateTime<Utc>) -> Self {
        Self {
            day: Some(instant.day()),
            ..Self::month(instant)
        }
    }
}
