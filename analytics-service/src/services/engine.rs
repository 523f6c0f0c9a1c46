//! Revenue analytics computed from declarative store aggregations.
//!
//! The engine holds no mutable state. Every operation issues its independent
//! rollups concurrently and fails as a whole when any of them fails.

use crate::models::InvoiceStatus;
use crate::services::buckets::{
    growth_rate, mean, percentage, AgingBucket, CalendarKey, DelayBucket,
};
use crate::services::metrics::{record_error, record_operation};
use crate::services::store::{
    CustomerSummary, Granularity, GroupKey, GroupSpec, GroupValue, InvoiceFilter, InvoiceGroup,
    InvoiceTotals, LineItemGroup, RecentInvoice, RecordStore, StoreError, TimeRange,
};
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub const DEFAULT_WINDOW_DAYS: i64 = 30;
pub const MAX_WINDOW_DAYS: i64 = 3650;

const TREND_MONTHS: i32 = 12;
const TOP_CUSTOMERS: usize = 10;
const RECENT_INVOICES: usize = 10;
const TOP_TREND_CUSTOMERS: usize = 20;
const TOP_SERVICES: usize = 15;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("{0}")]
    Validation(String),

    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl From<AnalyticsError> for AppError {
    fn from(err: AnalyticsError) -> Self {
        match err {
            AnalyticsError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            AnalyticsError::StoreUnavailable(e) => AppError::InternalError(anyhow::Error::new(e)),
        }
    }
}

fn validate_window(days: i64) -> Result<(), AnalyticsError> {
    if days <= 0 || days > MAX_WINDOW_DAYS {
        return Err(AnalyticsError::Validation(format!(
            "days must be between 1 and {}",
            MAX_WINDOW_DAYS
        )));
    }
    Ok(())
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>, AnalyticsError> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| AnalyticsError::Validation(format!("invalid date {}-{:02}", year, month)))
}

/// First instant of the month `offset` months after (year, month).
fn shifted_month_start(year: i32, month: u32, offset: i32) -> Result<DateTime<Utc>, AnalyticsError> {
    let index = year * 12 + month as i32 - 1 + offset;
    month_start(index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueOverview {
    pub total_revenue: f64,
    pub paid_revenue: f64,
    pub pending_revenue: f64,
    pub overdue_revenue: f64,
    pub average_invoice_value: f64,
    pub invoice_count: u64,
    pub previous_revenue: f64,
    pub previous_invoice_count: u64,
    pub revenue_growth: f64,
    pub invoice_growth: f64,
    pub collection_rate: f64,
}

impl RevenueOverview {
    fn from_totals(current: &InvoiceTotals, previous: &InvoiceTotals) -> Self {
        Self {
            total_revenue: current.total,
            paid_revenue: current.paid_total,
            pending_revenue: current.pending_total,
            overdue_revenue: current.overdue_total,
            average_invoice_value: current.average(),
            invoice_count: current.count,
            previous_revenue: previous.total,
            previous_invoice_count: previous.count,
            revenue_growth: growth_rate(current.total, previous.total),
            invoice_growth: growth_rate(current.count as f64, previous.count as f64),
            collection_rate: current.collection_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyTrendPoint {
    pub year: i32,
    pub month: u32,
    pub revenue: f64,
    pub invoice_count: u64,
    pub paid_revenue: f64,
    pub collection_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub status: InvoiceStatus,
    pub count: u64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopCustomer {
    pub customer_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub total_revenue: f64,
    pub invoice_count: u64,
    pub last_invoice_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgingRow {
    pub bucket: AgingBucket,
    pub count: u64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub window_days: i64,
    pub generated_at: DateTime<Utc>,
    pub revenue: RevenueOverview,
    pub customers: CustomerSummary,
    pub monthly_trend: Vec<MonthlyTrendPoint>,
    pub status_distribution: Vec<StatusCount>,
    pub top_customers: Vec<TopCustomer>,
    pub aging: Vec<AgingRow>,
    pub recent_invoices: Vec<RecentInvoice>,
}

// ---------------------------------------------------------------------------
// Revenue trends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendPeriod {
    Year,
    Quarter,
    Month,
    Week,
}

impl TrendPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendPeriod::Year => "year",
            TrendPeriod::Quarter => "quarter",
            TrendPeriod::Month => "month",
            TrendPeriod::Week => "week",
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            TrendPeriod::Year => Granularity::Month,
            TrendPeriod::Quarter => Granularity::Week,
            TrendPeriod::Month | TrendPeriod::Week => Granularity::Day,
        }
    }
}

impl FromStr for TrendPeriod {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "year" => Ok(TrendPeriod::Year),
            "quarter" => Ok(TrendPeriod::Quarter),
            "month" => Ok(TrendPeriod::Month),
            "week" => Ok(TrendPeriod::Week),
            other => Err(AnalyticsError::Validation(format!(
                "invalid period '{}', expected year, quarter, month or week",
                other
            ))),
        }
    }
}

/// Period selection for a revenue-trend request.
#[derive(Debug, Clone)]
pub struct TrendQuery {
    pub period: TrendPeriod,
    pub year: i32,
    pub quarter: Option<u32>,
    pub month: Option<u32>,
    pub week_start: Option<DateTime<Utc>>,
}

impl TrendQuery {
    /// Half-open created-at range selected by the period.
    pub fn range(&self) -> Result<TimeRange, AnalyticsError> {
        match self.period {
            TrendPeriod::Year => Ok(TimeRange::between(
                month_start(self.year, 1)?,
                month_start(self.year + 1, 1)?,
            )),
            TrendPeriod::Quarter => {
                let quarter = self
                    .quarter
                    .filter(|q| (1..=4).contains(q))
                    .ok_or_else(|| {
                        AnalyticsError::Validation("quarter must be between 1 and 4".into())
                    })?;
                let first_month = (quarter - 1) * 3 + 1;
                Ok(TimeRange::between(
                    month_start(self.year, first_month)?,
                    shifted_month_start(self.year, first_month, 3)?,
                ))
            }
            TrendPeriod::Month => {
                let month = self
                    .month
                    .filter(|m| (1..=12).contains(m))
                    .ok_or_else(|| {
                        AnalyticsError::Validation("month must be between 1 and 12".into())
                    })?;
                Ok(TimeRange::between(
                    month_start(self.year, month)?,
                    shifted_month_start(self.year, month, 1)?,
                ))
            }
            TrendPeriod::Week => {
                let start = self.week_start.ok_or_else(|| {
                    AnalyticsError::Validation("week_start is required for period=week".into())
                })?;
                Ok(TimeRange::between(start, start + Duration::days(7)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendBucket {
    #[serde(flatten)]
    pub key: CalendarKey,
    pub total_revenue: f64,
    pub paid_revenue: f64,
    pub pending_revenue: f64,
    pub overdue_revenue: f64,
    pub invoice_count: u64,
    pub paid_count: u64,
    pub average_value: f64,
    pub collection_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerRevenue {
    pub customer_id: String,
    pub name: Option<String>,
    pub total_revenue: f64,
    pub paid_revenue: f64,
    pub invoice_count: u64,
    pub average_value: f64,
    pub last_invoice_at: Option<DateTime<Utc>>,
    pub collection_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeasonalQuarter {
    pub quarter: u32,
    pub revenue: f64,
    pub invoice_count: u64,
    pub average_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendSummary {
    pub total_revenue: f64,
    pub total_paid: f64,
    pub total_pending: f64,
    pub total_overdue: f64,
    pub total_invoices: u64,
    pub average_invoice_value: f64,
    pub collection_rate: f64,
}

impl TrendSummary {
    /// Derived from the trend buckets so summary and detail always agree.
    pub fn from_buckets(buckets: &[TrendBucket]) -> Self {
        let mut summary = buckets.iter().fold(TrendSummary::default(), |mut acc, b| {
            acc.total_revenue += b.total_revenue;
            acc.total_paid += b.paid_revenue;
            acc.total_pending += b.pending_revenue;
            acc.total_overdue += b.overdue_revenue;
            acc.total_invoices += b.invoice_count;
            acc
        });
        summary.average_invoice_value = mean(summary.total_revenue, summary.total_invoices);
        summary.collection_rate = percentage(summary.total_paid, summary.total_revenue);
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayRow {
    pub bucket: DelayBucket,
    pub count: u64,
    pub amount: f64,
    pub average_delay_days: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevenueTrends {
    pub period: TrendPeriod,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub trends: Vec<TrendBucket>,
    pub revenue_by_customer: Vec<CustomerRevenue>,
    pub revenue_by_service: Vec<LineItemGroup>,
    pub seasonal: Option<Vec<SeasonalQuarter>>,
    pub summary: TrendSummary,
    pub payment_delays: Vec<DelayRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentDelayReport {
    pub window_days: i64,
    pub paid_invoices: u64,
    pub average_delay_days: f64,
    pub buckets: Vec<DelayRow>,
}

// ---------------------------------------------------------------------------
// Group decoding
// ---------------------------------------------------------------------------

fn single_totals(groups: Vec<InvoiceGroup>) -> InvoiceTotals {
    groups
        .into_iter()
        .next()
        .map(|g| g.totals)
        .unwrap_or_default()
}

fn customer_id(group: &InvoiceGroup) -> Option<&str> {
    match &group.key {
        GroupValue::Customer(id) => Some(id.as_str()),
        _ => None,
    }
}

fn aging_rows(groups: &[InvoiceGroup]) -> Vec<AgingRow> {
    AgingBucket::ALL
        .into_iter()
        .map(|bucket| {
            let totals = groups
                .iter()
                .find(|g| g.key == GroupValue::Aging(bucket))
                .map(|g| &g.totals);
            AgingRow {
                bucket,
                count: totals.map_or(0, |t| t.count),
                amount: totals.map_or(0.0, |t| t.total),
            }
        })
        .collect()
}

fn delay_rows(groups: &[InvoiceGroup]) -> Vec<DelayRow> {
    DelayBucket::ALL
        .into_iter()
        .map(|bucket| {
            let totals = groups
                .iter()
                .find(|g| g.key == GroupValue::Delay(bucket))
                .map(|g| &g.totals);
            DelayRow {
                bucket,
                count: totals.map_or(0, |t| t.count),
                amount: totals.map_or(0.0, |t| t.total),
                average_delay_days: totals.map_or(0.0, |t| t.average_delay_days()),
            }
        })
        .collect()
}

fn seasonal_quarters(groups: &[InvoiceGroup]) -> Vec<SeasonalQuarter> {
    (1..=4)
        .map(|quarter| {
            let totals = groups
                .iter()
                .find(|g| g.key == GroupValue::Quarter(quarter))
                .map(|g| &g.totals);
            SeasonalQuarter {
                quarter,
                revenue: totals.map_or(0.0, |t| t.total),
                invoice_count: totals.map_or(0, |t| t.count),
                average_value: totals.map_or(0.0, |t| t.average()),
            }
        })
        .collect()
}

fn trend_buckets(groups: Vec<InvoiceGroup>) -> Vec<TrendBucket> {
    groups
        .into_iter()
        .filter_map(|g| match g.key {
            GroupValue::Calendar(key) => Some(TrendBucket {
                key,
                total_revenue: g.totals.total,
                paid_revenue: g.totals.paid_total,
                pending_revenue: g.totals.pending_total,
                overdue_revenue: g.totals.overdue_total,
                invoice_count: g.totals.count,
                paid_count: g.totals.paid_count,
                average_value: g.totals.average(),
                collection_rate: g.totals.collection_rate(),
            }),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Arc<dyn RecordStore>,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn customer_names(
        &self,
        org_id: &str,
        groups: &[InvoiceGroup],
    ) -> Result<HashMap<String, (String, String)>, StoreError> {
        let ids: Vec<String> = groups
            .iter()
            .filter_map(customer_id)
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let customers = self.store.find_customers(org_id, &ids).await?;
        Ok(customers
            .into_iter()
            .map(|c| (c.id, (c.name, c.email)))
            .collect())
    }

    pub async fn compute_overview(
        &self,
        org_id: &str,
        window_days: i64,
    ) -> Result<Overview, AnalyticsError> {
        self.compute_overview_at(org_id, window_days, Utc::now())
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn compute_overview_at(
        &self,
        org_id: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Overview, AnalyticsError> {
        let started = Instant::now();
        let result = async {
            validate_window(window_days)?;
            self.overview(org_id, window_days, now).await
        }
        .await;
        observe("overview", &result, started);
        result
    }

    async fn overview(
        &self,
        org_id: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Overview, AnalyticsError> {
        let window = Duration::days(window_days);
        let start = now - window;
        let previous_start = now - window * 2;
        let trend_start = shifted_month_start(now.year(), now.month(), 1 - TREND_MONTHS)?;

        let current_filter = InvoiceFilter::for_org(org_id).created_in(TimeRange::since(start));
        let previous_filter = InvoiceFilter::for_org(org_id)
            .created_in(TimeRange::between(previous_start, start));
        let trend_filter =
            InvoiceFilter::for_org(org_id).created_in(TimeRange::since(trend_start));
        let org_filter = InvoiceFilter::for_org(org_id);
        let overdue_filter = InvoiceFilter::for_org(org_id)
            .with_statuses(&[InvoiceStatus::Sent, InvoiceStatus::Overdue])
            .due_before(now);

        let all = GroupSpec::by(GroupKey::All);
        let monthly = GroupSpec::by(GroupKey::Calendar(Granularity::Month));
        let by_status = GroupSpec::by(GroupKey::Status);
        let top_customers = GroupSpec::top(GroupKey::Customer, TOP_CUSTOMERS);
        let aging = GroupSpec::by(GroupKey::OverdueAge { as_of: now });

        let (current, previous, customers, trend, statuses, top, overdue, recent) = tokio::try_join!(
            self.store.group_invoices(&current_filter, &all),
            self.store.group_invoices(&previous_filter, &all),
            self.store.customer_summary(org_id),
            self.store.group_invoices(&trend_filter, &monthly),
            self.store.group_invoices(&org_filter, &by_status),
            self.store.group_invoices(&org_filter, &top_customers),
            self.store.group_invoices(&overdue_filter, &aging),
            self.store.find_recent_invoices(org_id, RECENT_INVOICES),
        )?;

        let names = self.customer_names(org_id, &top).await?;

        let current = single_totals(current);
        let previous = single_totals(previous);

        let monthly_trend = trend
            .into_iter()
            .filter_map(|g| match g.key {
                GroupValue::Calendar(key) => Some(MonthlyTrendPoint {
                    year: key.year,
                    month: key.month,
                    revenue: g.totals.total,
                    invoice_count: g.totals.count,
                    paid_revenue: g.totals.paid_total,
                    collection_rate: g.totals.collection_rate(),
                }),
                _ => None,
            })
            .collect();

        let status_distribution = statuses
            .into_iter()
            .filter_map(|g| match g.key {
                GroupValue::Status(status) => Some(StatusCount {
                    status,
                    count: g.totals.count,
                    amount: g.totals.total,
                }),
                _ => None,
            })
            .collect();

        let top_customers = top
            .iter()
            .filter_map(|g| {
                let id = customer_id(g)?;
                let resolved = names.get(id);
                Some(TopCustomer {
                    customer_id: id.to_string(),
                    name: resolved.map(|(name, _)| name.clone()),
                    email: resolved.map(|(_, email)| email.clone()),
                    total_revenue: g.totals.total,
                    invoice_count: g.totals.count,
                    last_invoice_at: g.totals.last_invoice_at,
                })
            })
            .collect();

        tracing::debug!(
            invoice_count = current.count,
            previous_count = previous.count,
            "Overview computed"
        );

        Ok(Overview {
            window_days,
            generated_at: now,
            revenue: RevenueOverview::from_totals(&current, &previous),
            customers,
            monthly_trend,
            status_distribution,
            top_customers,
            aging: aging_rows(&overdue),
            recent_invoices: recent,
        })
    }

    #[tracing::instrument(skip(self, query), fields(period = query.period.as_str()))]
    pub async fn compute_revenue_trends(
        &self,
        org_id: &str,
        query: &TrendQuery,
    ) -> Result<RevenueTrends, AnalyticsError> {
        let started = Instant::now();
        let result = async {
            let range = query.range()?;
            self.revenue_trends(org_id, query, range).await
        }
        .await;
        observe("revenue_trends", &result, started);
        result
    }

    async fn revenue_trends(
        &self,
        org_id: &str,
        query: &TrendQuery,
        range: TimeRange,
    ) -> Result<RevenueTrends, AnalyticsError> {
        let filter = InvoiceFilter::for_org(org_id).created_in(range);
        let paid_filter = filter.clone().with_statuses(&[InvoiceStatus::Paid]);

        let buckets_spec = GroupSpec::by(GroupKey::Calendar(query.period.granularity()));
        let customers_spec = GroupSpec::top(GroupKey::Customer, TOP_TREND_CUSTOMERS);
        let quarter_spec = GroupSpec::by(GroupKey::Quarter);
        let delay_spec = GroupSpec::by(GroupKey::PaymentDelay);

        let seasonal = async {
            if query.period == TrendPeriod::Year {
                self.store
                    .group_invoices(&filter, &quarter_spec)
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };

        let (buckets, customers, services, seasonal, delays) = tokio::try_join!(
            self.store.group_invoices(&filter, &buckets_spec),
            self.store.group_invoices(&filter, &customers_spec),
            self.store.group_line_items(&filter, TOP_SERVICES),
            seasonal,
            self.store.group_invoices(&paid_filter, &delay_spec),
        )?;

        let names = self.customer_names(org_id, &customers).await?;

        let revenue_by_customer = customers
            .iter()
            .filter_map(|g| {
                let id = customer_id(g)?;
                Some(CustomerRevenue {
                    customer_id: id.to_string(),
                    name: names.get(id).map(|(name, _)| name.clone()),
                    total_revenue: g.totals.total,
                    paid_revenue: g.totals.paid_total,
                    invoice_count: g.totals.count,
                    average_value: g.totals.average(),
                    last_invoice_at: g.totals.last_invoice_at,
                    collection_rate: g.totals.collection_rate(),
                })
            })
            .collect();

        let trends = trend_buckets(buckets);
        let summary = TrendSummary::from_buckets(&trends);

        Ok(RevenueTrends {
            period: query.period,
            range_start: range.from,
            range_end: range.to.unwrap_or_else(Utc::now),
            trends,
            revenue_by_customer,
            revenue_by_service: services,
            seasonal: seasonal.map(|groups| seasonal_quarters(&groups)),
            summary,
            payment_delays: delay_rows(&delays),
        })
    }

    pub async fn compute_payment_delays(
        &self,
        org_id: &str,
        window_days: i64,
    ) -> Result<PaymentDelayReport, AnalyticsError> {
        self.compute_payment_delays_at(org_id, window_days, Utc::now())
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn compute_payment_delays_at(
        &self,
        org_id: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<PaymentDelayReport, AnalyticsError> {
        let started = Instant::now();
        let result = async {
            validate_window(window_days)?;
            self.payment_delays(org_id, window_days, now).await
        }
        .await;
        observe("payment_delays", &result, started);
        result
    }

    async fn payment_delays(
        &self,
        org_id: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<PaymentDelayReport, AnalyticsError> {
        let filter = InvoiceFilter::for_org(org_id)
            .created_in(TimeRange::since(now - Duration::days(window_days)))
            .with_statuses(&[InvoiceStatus::Paid]);
        let groups = self
            .store
            .group_invoices(&filter, &GroupSpec::by(GroupKey::PaymentDelay))
            .await?;

        let paid_invoices: u64 = groups.iter().map(|g| g.totals.paid_count).sum();
        let delay_sum: f64 = groups.iter().map(|g| g.totals.delay_days_sum).sum();
        Ok(PaymentDelayReport {
            window_days,
            paid_invoices,
            average_delay_days: mean(delay_sum, paid_invoices),
            buckets: delay_rows(&groups),
        })
    }
}

fn observe<T>(operation: &str, result: &Result<T, AnalyticsError>, started: Instant) {
    record_operation(operation, result.is_ok(), started.elapsed().as_secs_f64());
    match result {
        Ok(_) => {}
        Err(e @ AnalyticsError::Validation(_)) => {
            record_error("validation");
            tracing::warn!(operation, error = %e, "Analytics request rejected");
        }
        Err(e) => {
            if matches!(e, AnalyticsError::StoreUnavailable(StoreError::Timeout(_))) {
                record_error("store_timeout");
            } else {
                record_error("store");
            }
            tracing::error!(operation, error = %e, "Analytics computation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Invoice, LineItem};
    use crate::services::memory_store::InMemoryRecordStore;
    use crate::services::store::{CustomerRef, LineItemGroup};
    use async_trait::async_trait;

    const ORG: &str = "org-1";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
    }

    fn invoice(
        id: &str,
        customer: &str,
        total: f64,
        status: InvoiceStatus,
        created_at: DateTime<Utc>,
    ) -> Invoice {
        Invoice {
            id: id.to_string(),
            org_id: ORG.to_string(),
            customer_id: customer.to_string(),
            invoice_number: format!("INV-{}", id),
            status,
            items: vec![],
            tax_amount: 0.0,
            discount_amount: 0.0,
            total,
            issue_date: created_at,
            due_date: created_at + Duration::days(30),
            created_at,
            updated_at: created_at,
            paid_at: None,
        }
    }

    async fn engine_with(invoices: Vec<Invoice>) -> AnalyticsEngine {
        let store = InMemoryRecordStore::new();
        for invoice in invoices {
            store.insert_invoice(invoice).await;
        }
        AnalyticsEngine::new(Arc::new(store))
    }

    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn group_invoices(
            &self,
            _filter: &InvoiceFilter,
            _spec: &GroupSpec,
        ) -> Result<Vec<InvoiceGroup>, StoreError> {
            Err(StoreError::Timeout(std::time::Duration::from_secs(10)))
        }

        async fn group_line_items(
            &self,
            _filter: &InvoiceFilter,
            _limit: usize,
        ) -> Result<Vec<LineItemGroup>, StoreError> {
            Ok(vec![])
        }

        async fn find_recent_invoices(
            &self,
            _org_id: &str,
            _limit: usize,
        ) -> Result<Vec<RecentInvoice>, StoreError> {
            Ok(vec![])
        }

        async fn customer_summary(&self, _org_id: &str) -> Result<CustomerSummary, StoreError> {
            Ok(CustomerSummary::default())
        }

        async fn find_customers(
            &self,
            _org_id: &str,
            _ids: &[String],
        ) -> Result<Vec<CustomerRef>, StoreError> {
            Ok(vec![])
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Err(StoreError::Query("down".into()))
        }
    }

    #[tokio::test]
    async fn empty_org_overview_has_zero_ratios() {
        let engine = engine_with(vec![]).await;

        let overview = engine.compute_overview_at(ORG, 30, now()).await.unwrap();

        assert_eq!(overview.revenue.total_revenue, 0.0);
        assert_eq!(overview.revenue.revenue_growth, 0.0);
        assert_eq!(overview.revenue.invoice_growth, 0.0);
        assert_eq!(overview.revenue.collection_rate, 0.0);
        assert_eq!(overview.revenue.average_invoice_value, 0.0);
        assert!(overview.monthly_trend.is_empty());
        assert_eq!(overview.aging.len(), 4);
        assert!(overview.aging.iter().all(|row| row.count == 0));
    }

    #[tokio::test]
    async fn revenue_growth_compares_adjacent_windows() {
        let now = now();
        let engine = engine_with(vec![
            invoice("1", "c1", 6_000.0, InvoiceStatus::Paid, now - Duration::days(2)),
            invoice("2", "c1", 4_000.0, InvoiceStatus::Sent, now - Duration::days(10)),
            invoice("3", "c2", 8_000.0, InvoiceStatus::Paid, now - Duration::days(45)),
        ])
        .await;

        let overview = engine.compute_overview_at(ORG, 30, now).await.unwrap();

        assert_eq!(overview.revenue.total_revenue, 10_000.0);
        assert_eq!(overview.revenue.previous_revenue, 8_000.0);
        assert_eq!(overview.revenue.revenue_growth, 25.0);
        assert_eq!(overview.revenue.paid_revenue, 6_000.0);
        assert_eq!(overview.revenue.pending_revenue, 4_000.0);
        assert_eq!(overview.revenue.collection_rate, 60.0);
        assert_eq!(overview.revenue.average_invoice_value, 5_000.0);
    }

    #[tokio::test]
    async fn window_edges_are_contiguous() {
        let now = now();
        let start = now - Duration::days(30);
        let engine = engine_with(vec![
            // Exactly on the boundary belongs to the current window only.
            invoice("1", "c1", 100.0, InvoiceStatus::Sent, start),
            invoice("2", "c1", 50.0, InvoiceStatus::Sent, now - Duration::days(60)),
            invoice("3", "c1", 25.0, InvoiceStatus::Sent, now - Duration::days(61)),
        ])
        .await;

        let overview = engine.compute_overview_at(ORG, 30, now).await.unwrap();

        assert_eq!(overview.revenue.invoice_count, 1);
        assert_eq!(overview.revenue.total_revenue, 100.0);
        assert_eq!(overview.revenue.previous_invoice_count, 1);
        assert_eq!(overview.revenue.previous_revenue, 50.0);
    }

    #[tokio::test]
    async fn zero_previous_revenue_means_zero_growth() {
        let now = now();
        let engine = engine_with(vec![invoice(
            "1",
            "c1",
            500.0,
            InvoiceStatus::Sent,
            now - Duration::days(1),
        )])
        .await;

        let overview = engine.compute_overview_at(ORG, 30, now).await.unwrap();
        assert_eq!(overview.revenue.revenue_growth, 0.0);
        assert!(overview.revenue.revenue_growth.is_finite());
    }

    #[tokio::test]
    async fn overview_ranks_customers_and_ages_overdue() {
        let now = now();
        let store = InMemoryRecordStore::new();
        store
            .insert_customer(Customer {
                id: "c1".into(),
                org_id: ORG.into(),
                name: "Acme Print".into(),
                email: "ap@acme.test".into(),
                outstanding_balance: 300.0,
                is_active: true,
            })
            .await;
        let mut late = invoice("1", "c1", 300.0, InvoiceStatus::Overdue, now - Duration::days(80));
        late.due_date = now - Duration::days(45);
        store.insert_invoice(late).await;
        store
            .insert_invoice(invoice("2", "c2", 900.0, InvoiceStatus::Paid, now - Duration::days(3)))
            .await;
        let engine = AnalyticsEngine::new(Arc::new(store));

        let overview = engine.compute_overview_at(ORG, 30, now).await.unwrap();

        assert_eq!(overview.top_customers[0].customer_id, "c2");
        assert_eq!(overview.top_customers[0].name, None);
        assert_eq!(overview.top_customers[1].name.as_deref(), Some("Acme Print"));
        let aging: Vec<_> = overview.aging.iter().map(|r| (r.bucket, r.count)).collect();
        assert_eq!(
            aging,
            vec![
                (AgingBucket::UpTo30, 0),
                (AgingBucket::UpTo60, 1),
                (AgingBucket::UpTo90, 0),
                (AgingBucket::Over90, 0),
            ]
        );
        assert_eq!(overview.customers.total_customers, 1);
        assert_eq!(overview.status_distribution.len(), 2);
        assert_eq!(overview.recent_invoices[0].id, "2");
    }

    #[tokio::test]
    async fn overview_rejects_bad_window() {
        let engine = engine_with(vec![]).await;

        let err = engine.compute_overview_at(ORG, 0, now()).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Validation(_)));

        let err = engine
            .compute_overview_at(ORG, MAX_WINDOW_DAYS + 1, now())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Validation(_)));
    }

    #[tokio::test]
    async fn rejected_requests_are_counted_as_validation_errors() {
        use crate::services::metrics::{ANALYTICS_REQUESTS_TOTAL, ERRORS_TOTAL};

        let engine = engine_with(vec![]).await;
        let validation = || ERRORS_TOTAL.with_label_values(&["validation"]).get();
        let failed_delays = || {
            ANALYTICS_REQUESTS_TOTAL
                .with_label_values(&["payment_delays", "error"])
                .get()
        };
        let before = validation();
        let delays_before = failed_delays();

        engine.compute_overview_at(ORG, 0, now()).await.unwrap_err();
        engine
            .compute_payment_delays_at(ORG, MAX_WINDOW_DAYS + 1, now())
            .await
            .unwrap_err();
        engine
            .compute_revenue_trends(
                ORG,
                &TrendQuery {
                    period: TrendPeriod::Week,
                    year: 2026,
                    quarter: None,
                    month: None,
                    week_start: None,
                },
            )
            .await
            .unwrap_err();

        assert!(validation() >= before + 3.0);
        assert!(failed_delays() >= delays_before + 1.0);
    }

    #[tokio::test]
    async fn store_failure_aborts_whole_operation() {
        let engine = AnalyticsEngine::new(Arc::new(FailingStore));

        let err = engine.compute_overview_at(ORG, 30, now()).await.unwrap_err();
        assert!(matches!(
            err,
            AnalyticsError::StoreUnavailable(StoreError::Timeout(_))
        ));

        let app_error: AppError = err.into();
        assert!(matches!(app_error, AppError::InternalError(_)));
    }

    #[tokio::test]
    async fn yearly_trends_summary_matches_buckets() {
        let engine = engine_with(vec![
            invoice(
                "1",
                "c1",
                100.0,
                InvoiceStatus::Paid,
                Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap(),
            ),
            invoice(
                "2",
                "c1",
                300.0,
                InvoiceStatus::Sent,
                Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap(),
            ),
            invoice(
                "3",
                "c2",
                600.0,
                InvoiceStatus::Overdue,
                Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap(),
            ),
            invoice(
                "4",
                "c2",
                999.0,
                InvoiceStatus::Paid,
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            ),
        ])
        .await;
        let query = TrendQuery {
            period: TrendPeriod::Year,
            year: 2025,
            quarter: None,
            month: None,
            week_start: None,
        };

        let trends = engine.compute_revenue_trends(ORG, &query).await.unwrap();

        let months: Vec<_> = trends.trends.iter().map(|b| b.key.month).collect();
        assert_eq!(months, vec![2, 11]);
        assert_eq!(trends.trends[0].collection_rate, 25.0);
        assert_eq!(trends.summary.total_revenue, 1_000.0);
        assert_eq!(trends.summary.total_paid, 100.0);
        assert_eq!(trends.summary.total_overdue, 600.0);
        assert_eq!(trends.summary.collection_rate, 10.0);

        let seasonal = trends.seasonal.expect("seasonal analysis for year period");
        assert_eq!(seasonal.len(), 4);
        assert_eq!(seasonal[0].revenue, 400.0);
        assert_eq!(seasonal[1].invoice_count, 0);
        assert_eq!(seasonal[3].revenue, 600.0);
        assert_eq!(trends.revenue_by_customer[0].customer_id, "c2");
    }

    #[tokio::test]
    async fn revenue_by_service_ranks_descriptions() {
        let created = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let mut first = invoice("1", "c1", 100.0, InvoiceStatus::Paid, created);
        first.items = vec![LineItem::new("Printing", 1.0, 100.0)];
        let mut second = invoice("2", "c1", 150.0, InvoiceStatus::Paid, created);
        second.items = vec![
            LineItem::new("Printing", 1.0, 100.0),
            LineItem::new("Binding", 1.0, 50.0),
        ];
        let engine = engine_with(vec![first, second]).await;
        let query = TrendQuery {
            period: TrendPeriod::Month,
            year: 2025,
            quarter: None,
            month: Some(3),
            week_start: None,
        };

        let trends = engine.compute_revenue_trends(ORG, &query).await.unwrap();

        let services: Vec<_> = trends
            .revenue_by_service
            .iter()
            .map(|s| (s.description.as_str(), s.total_amount, s.invoice_count))
            .collect();
        assert_eq!(services, vec![("Printing", 200.0, 2), ("Binding", 50.0, 1)]);
        assert!(trends.seasonal.is_none());
        assert_eq!(trends.trends[0].key.day, Some(10));
    }

    #[tokio::test]
    async fn weekly_trends_cover_seven_days_half_open() {
        let week_start = Utc.with_ymd_and_hms(2026, 3, 30, 0, 0, 0).unwrap();
        let engine = engine_with(vec![
            invoice("1", "c1", 100.0, InvoiceStatus::Paid, week_start),
            invoice("2", "c1", 50.0, InvoiceStatus::Sent, week_start + Duration::days(2)),
            invoice("3", "c2", 999.0, InvoiceStatus::Paid, week_start + Duration::days(7)),
            invoice("4", "c2", 777.0, InvoiceStatus::Paid, week_start - Duration::seconds(1)),
        ])
        .await;
        let query = TrendQuery {
            period: TrendPeriod::Week,
            year: 2026,
            quarter: None,
            month: None,
            week_start: Some(week_start),
        };

        let trends = engine.compute_revenue_trends(ORG, &query).await.unwrap();

        let keys: Vec<_> = trends
            .trends
            .iter()
            .map(|b| (b.key.month, b.key.day))
            .collect();
        assert_eq!(keys, vec![(3, Some(30)), (4, Some(1))]);
        assert_eq!(trends.summary.total_invoices, 2);
        assert_eq!(trends.summary.total_revenue, 150.0);
        assert_eq!(trends.range_end, week_start + Duration::days(7));
        assert!(trends.seasonal.is_none());
        assert_eq!(trends.revenue_by_customer.len(), 1);
    }

    #[tokio::test]
    async fn quarterly_trends_group_by_iso_week() {
        let at = |month, day, hour, minute| {
            Utc.with_ymd_and_hms(2026, month, day, hour, minute, 0).unwrap()
        };
        let engine = engine_with(vec![
            invoice("1", "c1", 100.0, InvoiceStatus::Paid, at(4, 1, 9, 0)),
            invoice("2", "c1", 200.0, InvoiceStatus::Sent, at(4, 8, 9, 0)),
            invoice("3", "c1", 50.0, InvoiceStatus::Sent, at(6, 30, 23, 59)),
            invoice("4", "c1", 400.0, InvoiceStatus::Paid, at(7, 1, 0, 0)),
            invoice("5", "c1", 800.0, InvoiceStatus::Paid, at(3, 31, 23, 59)),
        ])
        .await;
        let query = TrendQuery {
            period: TrendPeriod::Quarter,
            year: 2026,
            quarter: Some(2),
            month: None,
            week_start: None,
        };

        let trends = engine.compute_revenue_trends(ORG, &query).await.unwrap();

        let keys: Vec<_> = trends
            .trends
            .iter()
            .map(|b| (b.key.month, b.key.week, b.key.day))
            .collect();
        assert_eq!(
            keys,
            vec![(4, Some(14), None), (4, Some(15), None), (6, Some(27), None)]
        );
        assert_eq!(trends.summary.total_revenue, 350.0);
        assert_eq!(trends.summary.total_paid, 100.0);
        assert!(trends.seasonal.is_none());
    }

    #[test]
    fn trend_ranges() {
        let query = |period, quarter, month| TrendQuery {
            period,
            year: 2025,
            quarter,
            month,
            week_start: None,
        };

        let q4 = query(TrendPeriod::Quarter, Some(4), None).range().unwrap();
        assert_eq!(q4.from, Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(q4.to, Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));

        let dec = query(TrendPeriod::Month, None, Some(12)).range().unwrap();
        assert_eq!(dec.to, Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));

        assert!(query(TrendPeriod::Quarter, None, None).range().is_err());
        assert!(query(TrendPeriod::Quarter, Some(5), None).range().is_err());
        assert!(query(TrendPeriod::Month, None, Some(13)).range().is_err());
        assert!(query(TrendPeriod::Week, None, None).range().is_err());
        assert!("fortnight".parse::<TrendPeriod>().is_err());
        assert_eq!("Quarter".parse::<TrendPeriod>().unwrap(), TrendPeriod::Quarter);
    }

    #[tokio::test]
    async fn payment_delays_use_paid_timestamp() {
        let now = now();
        let created = now - Duration::days(20);
        let paid = |id: &str, delay_days: i64| {
            let mut inv = invoice(id, "c1", 100.0, InvoiceStatus::Paid, created);
            inv.due_date = created + Duration::days(5);
            inv.paid_at = Some(inv.due_date + Duration::days(delay_days));
            inv.updated_at = now;
            inv
        };
        let engine = engine_with(vec![
            paid("1", 0),
            paid("2", 7),
            paid("3", 30),
            paid("4", 31),
            invoice("5", "c1", 100.0, InvoiceStatus::Sent, created),
        ])
        .await;

        let report = engine
            .compute_payment_delays_at(ORG, 30, now)
            .await
            .unwrap();

        let counts: Vec<_> = report.buckets.iter().map(|r| (r.bucket, r.count)).collect();
        assert_eq!(
            counts,
            vec![
                (DelayBucket::OnTime, 1),
                (DelayBucket::UpTo7, 1),
                (DelayBucket::UpTo30, 1),
                (DelayBucket::Over30, 1),
            ]
        );
        assert_eq!(report.paid_invoices, 4);
        assert_eq!(report.average_delay_days, 17.0);
        assert_eq!(report.buckets[3].average_delay_days, 31.0);
    }
}
