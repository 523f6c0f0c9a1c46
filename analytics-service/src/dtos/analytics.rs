use crate::models::InvoiceStatus;
use crate::services::buckets::percentage;
use crate::services::engine::{
    AgingRow, AnalyticsError, MonthlyTrendPoint, Overview, RevenueOverview, StatusCount,
    TopCustomer, TrendPeriod, TrendQuery, DEFAULT_WINDOW_DAYS, MAX_WINDOW_DAYS,
};
use crate::services::store::{CustomerSummary, RecentInvoice};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct WindowParams {
    #[validate(range(min = 1, max = 3650, message = "days must be between 1 and 3650"))]
    pub days: Option<i64>,
}

impl WindowParams {
    pub fn days(&self) -> i64 {
        self.days.unwrap_or(DEFAULT_WINDOW_DAYS).min(MAX_WINDOW_DAYS)
    }

    pub fn cache_params(&self) -> String {
        format!("days={}", self.days())
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RevenueParams {
    #[serde(default = "default_period")]
    pub period: String,
    #[validate(range(min = 1970, max = 9999, message = "year is out of range"))]
    pub year: Option<i32>,
    #[validate(range(min = 1, max = 4, message = "quarter must be between 1 and 4"))]
    pub quarter: Option<u32>,
    #[validate(range(min = 1, max = 12, message = "month must be between 1 and 12"))]
    pub month: Option<u32>,
    /// RFC 3339 instant or `YYYY-MM-DD` (midnight UTC).
    pub week_start: Option<String>,
}

fn default_period() -> String {
    TrendPeriod::Year.as_str().to_string()
}

fn parse_week_start(raw: &str) -> Result<DateTime<Utc>, AnalyticsError> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            AnalyticsError::Validation(format!(
                "week_start '{}' is not an RFC 3339 timestamp or YYYY-MM-DD date",
                raw
            ))
        })
}

impl RevenueParams {
    /// Resolve into an engine query; the year defaults to the current one.
    pub fn to_query(&self, now: DateTime<Utc>) -> Result<TrendQuery, AnalyticsError> {
        Ok(TrendQuery {
            period: self.period.parse()?,
            year: self.year.unwrap_or_else(|| now.year()),
            quarter: self.quarter,
            month: self.month,
            week_start: self
                .week_start
                .as_deref()
                .map(parse_week_start)
                .transpose()?,
        })
    }
}

/// Cache key fragment for a resolved query.
pub fn trend_cache_params(query: &TrendQuery) -> String {
    format!(
        "period={}&year={}&quarter={}&month={}&week_start={}",
        query.period.as_str(),
        query.year,
        query.quarter.map(|q| q.to_string()).unwrap_or_default(),
        query.month.map(|m| m.to_string()).unwrap_or_default(),
        query
            .week_start
            .map(|w| w.timestamp_millis().to_string())
            .unwrap_or_default(),
    )
}

#[derive(Debug, Serialize)]
pub struct StatusDistributionEntry {
    pub status: InvoiceStatus,
    pub count: u64,
    pub amount: f64,
    pub percentage: f64,
}

/// Share of each status in the organization's invoice count.
pub fn status_distribution(counts: &[StatusCount]) -> Vec<StatusDistributionEntry> {
    let total: u64 = counts.iter().map(|c| c.count).sum();
    counts
        .iter()
        .map(|c| StatusDistributionEntry {
            status: c.status,
            count: c.count,
            amount: c.amount,
            percentage: percentage(c.count as f64, total as f64),
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub window_days: i64,
    pub generated_at: DateTime<Utc>,
    pub revenue: RevenueOverview,
    pub customers: CustomerSummary,
    pub monthly_trend: Vec<MonthlyTrendPoint>,
    pub status_distribution: Vec<StatusDistributionEntry>,
    pub top_customers: Vec<TopCustomer>,
    pub aging: Vec<AgingRow>,
    pub recent_invoices: Vec<RecentInvoice>,
}

impl From<Overview> for OverviewResponse {
    fn from(overview: Overview) -> Self {
        Self {
            window_days: overview.window_days,
            generated_at: overview.generated_at,
            status_distribution: status_distribution(&overview.status_distribution),
            revenue: overview.revenue,
            customers: overview.customers,
            monthly_trend: overview.monthly_trend,
            top_customers: overview.top_customers,
            aging: overview.aging,
            recent_invoices: overview.recent_invoices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn percentages_share_the_total_count() {
        let counts = vec![
            StatusCount {
                status: InvoiceStatus::Paid,
                count: 3,
                amount: 300.0,
            },
            StatusCount {
                status: InvoiceStatus::Sent,
                count: 1,
                amount: 50.0,
            },
        ];

        let entries = status_distribution(&counts);

        assert_eq!(entries[0].percentage, 75.0);
        assert_eq!(entries[1].percentage, 25.0);
        assert!(status_distribution(&[]).is_empty());
    }

    #[test]
    fn window_params_validate_range() {
        assert!(WindowParams { days: Some(0) }.validate().is_err());
        assert!(WindowParams { days: Some(3651) }.validate().is_err());
        assert!(WindowParams { days: Some(90) }.validate().is_ok());
        assert_eq!(WindowParams::default().days(), 30);
    }

    #[test]
    fn revenue_params_resolve_defaults_and_dates() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let params = RevenueParams {
            period: "week".into(),
            year: None,
            quarter: None,
            month: None,
            week_start: Some("2026-04-06".into()),
        };

        let query = params.to_query(now).unwrap();

        assert_eq!(query.period, TrendPeriod::Week);
        assert_eq!(query.year, 2026);
        assert_eq!(
            query.week_start,
            Some(Utc.with_ymd_and_hms(2026, 4, 6, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn revenue_params_reject_bad_input() {
        let now = Utc::now();
        let bad_period = RevenueParams {
            period: "decade".into(),
            year: None,
            quarter: None,
            month: None,
            week_start: None,
        };
        assert!(bad_period.to_query(now).is_err());

        let bad_week = RevenueParams {
            period: "week".into(),
            year: None,
            quarter: None,
            month: None,
            week_start: Some("last monday".into()),
        };
        assert!(bad_week.to_query(now).is_err());

        let bad_quarter = RevenueParams {
            period: "quarter".into(),
            year: Some(2026),
            quarter: Some(5),
            month: None,
            week_start: None,
        };
        assert!(bad_quarter.validate().is_err());
    }
}
