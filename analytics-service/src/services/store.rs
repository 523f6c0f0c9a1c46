//! Read-only record store contract.
//!
//! Aggregations are described declaratively (filter + group key + reducer set
//! + ordering) so the same request can be answered by a MongoDB aggregation
//! pipeline or by folding records in memory. Every implementation must return
//! identical groups, ordering and tie-breaks for the same data.

use crate::models::{Invoice, InvoiceStatus};
use crate::services::buckets::{AgingBucket, CalendarKey, DelayBucket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),

    #[error("store query timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to decode store result: {0}")]
    Decode(String),
}

/// Half-open `[from, to)` range; an absent `to` means "up to now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn since(from: DateTime<Utc>) -> Self {
        Self { from, to: None }
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to: Some(to) }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from && self.to.map_or(true, |to| instant < to)
    }
}

/// Which invoices take part in an aggregation. Always tenant scoped.
#[derive(Debug, Clone)]
pub struct InvoiceFilter {
    pub org_id: String,
    pub created: Option<TimeRange>,
    pub statuses: Option<Vec<InvoiceStatus>>,
    pub due_before: Option<DateTime<Utc>>,
}

impl InvoiceFilter {
    pub fn for_org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            created: None,
            statuses: None,
            due_before: None,
        }
    }

    pub fn created_in(mut self, range: TimeRange) -> Self {
        self.created = Some(range);
        self
    }

    pub fn with_statuses(mut self, statuses: &[InvoiceStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn due_before(mut self, instant: DateTime<Utc>) -> Self {
        self.due_before = Some(instant);
        self
    }

    pub fn matches(&self, invoice: &Invoice) -> bool {
        invoice.org_id == self.org_id
            && self
                .created
                .map_or(true, |range| range.contains(invoice.created_at))
            && self
                .statuses
                .as_ref()
                .map_or(true, |statuses| statuses.contains(&invoice.status))
            && self
                .due_before
                .map_or(true, |instant| invoice.due_date < instant)
    }
}

/// Calendar resolution for time-series grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// (year, month)
    Month,
    /// (year, month, ISO week)
    Week,
    /// (year, month, day)
    Day,
}

/// Group-key selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKey {
    All,
    Status,
    Customer,
    Calendar(Granularity),
    /// Calendar quarter of `created_at`.
    Quarter,
    /// Aging bucket of `as_of - due_date`.
    OverdueAge { as_of: DateTime<Utc> },
    /// Delay bucket of `settled_at - due_date`.
    PaymentDelay,
}

/// Value of a group key for one group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum GroupValue {
    All,
    Status(InvoiceStatus),
    Customer(String),
    Calendar(CalendarKey),
    Quarter(u32),
    Aging(AgingBucket),
    Delay(DelayBucket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOrder {
    /// Lexicographic on the key tuple.
    KeyAscending,
    /// Summed total, largest first; ties by key ascending.
    TotalDescending,
}

#[derive(Debug, Clone, Copy)]
pub struct GroupSpec {
    pub key: GroupKey,
    pub order: GroupOrder,
    pub limit: Option<usize>,
}

impl GroupSpec {
    pub fn by(key: GroupKey) -> Self {
        Self {
            key,
            order: GroupOrder::KeyAscending,
            limit: None,
        }
    }

    pub fn top(key: GroupKey, limit: usize) -> Self {
        Self {
            key,
            order: GroupOrder::TotalDescending,
            limit: Some(limit),
        }
    }
}

/// Reducer set computed for every group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvoiceTotals {
    pub count: u64,
    pub total: f64,
    pub paid_total: f64,
    pub paid_count: u64,
    pub pending_total: f64,
    pub overdue_total: f64,
    pub last_invoice_at: Option<DateTime<Utc>>,
    /// Sum of `(settled_at - due_date)` in days over paid invoices.
    pub delay_days_sum: f64,
}

impl InvoiceTotals {
    pub fn add(&mut self, invoice: &Invoice) {
        self.count += 1;
        self.total += invoice.total;
        match invoice.status {
            InvoiceStatus::Paid => {
                self.paid_total += invoice.total;
                self.paid_count += 1;
                self.delay_days_sum +=
                    crate::services::buckets::days_between(invoice.settled_at(), invoice.due_date);
            }
            InvoiceStatus::Sent => self.pending_total += invoice.total,
            InvoiceStatus::Overdue => self.overdue_total += invoice.total,
            _ => {}
        }
        self.last_invoice_at = match self.last_invoice_at {
            Some(last) if last >= invoice.created_at => Some(last),
            _ => Some(invoice.created_at),
        };
    }

    pub fn average(&self) -> f64 {
        crate::services::buckets::mean(self.total, self.count)
    }

    pub fn collection_rate(&self) -> f64 {
        crate::services::buckets::percentage(self.paid_total, self.total)
    }

    pub fn average_delay_days(&self) -> f64 {
        crate::services::buckets::mean(self.delay_days_sum, self.paid_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceGroup {
    pub key: GroupValue,
    pub totals: InvoiceTotals,
}

/// Sort and truncate groups according to `spec`. Shared by every store so
/// ordering semantics cannot drift between implementations.
pub fn order_groups(groups: &mut Vec<InvoiceGroup>, spec: &GroupSpec) {
    match spec.order {
        GroupOrder::KeyAscending => groups.sort_by(|a, b| a.key.cmp(&b.key)),
        GroupOrder::TotalDescending => groups.sort_by(|a, b| {
            b.totals
                .total
                .partial_cmp(&a.totals.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        }),
    }
    if let Some(limit) = spec.limit {
        groups.truncate(limit);
    }
}

/// Line items exploded across invoices and grouped by description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItemGroup {
    pub description: String,
    pub total_amount: f64,
    pub total_quantity: f64,
    pub average_rate: f64,
    pub invoice_count: u64,
}

pub fn order_line_items(groups: &mut Vec<LineItemGroup>, limit: usize) {
    groups.sort_by(|a, b| {
        b.total_amount
            .partial_cmp(&a.total_amount)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.description.cmp(&b.description))
    });
    groups.truncate(limit);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentInvoice {
    pub id: String,
    pub invoice_number: String,
    pub customer_id: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub status: InvoiceStatus,
    pub total: f64,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Organization-wide customer counts and balances.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomerSummary {
    pub total_customers: u64,
    pub active_customers: u64,
    pub total_outstanding: f64,
    pub average_outstanding: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerRef {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Filter, group and reduce invoices.
    async fn group_invoices(
        &self,
        filter: &InvoiceFilter,
        spec: &GroupSpec,
    ) -> Result<Vec<InvoiceGroup>, StoreError>;

    /// Explode line items of matching invoices and group them by description.
    async fn group_line_items(
        &self,
        filter: &InvoiceFilter,
        limit: usize,
    ) -> Result<Vec<LineItemGroup>, StoreError>;

    /// Most recently created invoices with the customer resolved.
    async fn find_recent_invoices(
        &self,
        org_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentInvoice>, StoreError>;

    async fn customer_summary(&self, org_id: &str) -> Result<CustomerSummary, StoreError>;

    async fn find_customers(
        &self,
        org_id: &str,
        ids: &[String],
    ) -> Result<Vec<CustomerRef>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
