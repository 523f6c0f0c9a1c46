//! In-process record store.
//!
//! Answers the declarative aggregations by folding records held in memory.
//! Used by tests and for running the service without MongoDB.

use crate::models::{Customer, Invoice};
use crate::services::buckets::{
    days_between, quarter_of_month, AgingBucket, CalendarKey, DelayBucket,
};
use crate::services::store::{
    order_groups, order_line_items, CustomerRef, CustomerSummary, Granularity, GroupKey,
    GroupSpec, GroupValue, InvoiceFilter, InvoiceGroup, InvoiceTotals, LineItemGroup,
    RecentInvoice, RecordStore, StoreError,
};
use async_trait::async_trait;
use chrono::Datelike;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    invoices: Arc<RwLock<Vec<Invoice>>>,
    customers: Arc<RwLock<Vec<Customer>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.invoices.write().await.push(invoice);
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.customers.write().await.push(customer);
    }

    pub async fn invoice_count(&self) -> usize {
        self.invoices.read().await.len()
    }
}

fn group_value(key: &GroupKey, invoice: &Invoice) -> GroupValue {
    match key {
        GroupKey::All => GroupValue::All,
        GroupKey::Status => GroupValue::Status(invoice.status),
        GroupKey::Customer => GroupValue::Customer(invoice.customer_id.clone()),
        GroupKey::Calendar(Granularity::Month) => {
            GroupValue::Calendar(CalendarKey::month(invoice.created_at))
        }
        GroupKey::Calendar(Granularity::Week) => {
            GroupValue::Calendar(CalendarKey::week(invoice.created_at))
        }
        GroupKey::Calendar(Granularity::Day) => {
            GroupValue::Calendar(CalendarKey::day(invoice.created_at))
        }
        GroupKey::Quarter => GroupValue::Quarter(quarter_of_month(invoice.created_at.month())),
        GroupKey::OverdueAge { as_of } => {
            GroupValue::Aging(AgingBucket::for_days(days_between(*as_of, invoice.due_date)))
        }
        GroupKey::PaymentDelay => GroupValue::Delay(DelayBucket::for_delay(days_between(
            invoice.settled_at(),
            invoice.due_date,
        ))),
    }
}

#[derive(Default)]
struct LineItemAccumulator {
    amount: f64,
    quantity: f64,
    rate_sum: f64,
    rows: u64,
    invoices: HashSet<String>,
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn group_invoices(
        &self,
        filter: &InvoiceFilter,
        spec: &GroupSpec,
    ) -> Result<Vec<InvoiceGroup>, StoreError> {
        let invoices = self.invoices.read().await;

        let mut groups: BTreeMap<GroupValue, InvoiceTotals> = BTreeMap::new();
        for invoice in invoices.iter().filter(|i| filter.matches(i)) {
            groups
                .entry(group_value(&spec.key, invoice))
                .or_default()
                .add(invoice);
        }

        let mut groups: Vec<InvoiceGroup> = groups
            .into_iter()
            .map(|(key, totals)| InvoiceGroup { key, totals })
            .collect();
        order_groups(&mut groups, spec);
        Ok(groups)
    }

    async fn group_line_items(
        &self,
        filter: &InvoiceFilter,
        limit: usize,
    ) -> Result<Vec<LineItemGroup>, StoreError> {
        let invoices = self.invoices.read().await;

        let mut by_description: HashMap<String, LineItemAccumulator> = HashMap::new();
        for invoice in invoices.iter().filter(|i| filter.matches(i)) {
            for item in &invoice.items {
                let acc = by_description.entry(item.description.clone()).or_default();
                acc.amount += item.amount;
                acc.quantity += item.quantity;
                acc.rate_sum += item.rate;
                acc.rows += 1;
                acc.invoices.insert(invoice.id.clone());
            }
        }

        let mut groups: Vec<LineItemGroup> = by_description
            .into_iter()
            .map(|(description, acc)| LineItemGroup {
                description,
                total_amount: acc.amount,
                total_quantity: acc.quantity,
                average_rate: acc.rate_sum / acc.rows as f64,
                invoice_count: acc.invoices.len() as u64,
            })
            .collect();
        order_line_items(&mut groups, limit);
        Ok(groups)
    }

    async fn find_recent_invoices(
        &self,
        org_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentInvoice>, StoreError> {
        let invoices = self.invoices.read().await;
        let customers = self.customers.read().await;

        let mut recent: Vec<&Invoice> = invoices.iter().filter(|i| i.org_id == org_id).collect();
        recent.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(recent
            .into_iter()
            .take(limit)
            .map(|invoice| {
                let customer = customers
                    .iter()
                    .find(|c| c.org_id == org_id && c.id == invoice.customer_id);
                RecentInvoice {
                    id: invoice.id.clone(),
                    invoice_number: invoice.invoice_number.clone(),
                    customer_id: invoice.customer_id.clone(),
                    customer_name: customer.map(|c| c.name.clone()),
                    customer_email: customer.map(|c| c.email.clone()),
                    status: invoice.status,
                    total: invoice.total,
                    due_date: invoice.due_date,
                    created_at: invoice.created_at,
                }
            })
            .collect())
    }

    async fn customer_summary(&self, org_id: &str) -> Result<CustomerSummary, StoreError> {
        let customers = self.customers.read().await;

        let mut summary = CustomerSummary::default();
        for customer in customers.iter().filter(|c| c.org_id == org_id) {
            summary.total_customers += 1;
            if customer.is_active {
                summary.active_customers += 1;
            }
            summary.total_outstanding += customer.outstanding_balance;
        }
        summary.average_outstanding =
            crate::services::buckets::mean(summary.total_outstanding, summary.total_customers);
        Ok(summary)
    }

    async fn find_customers(
        &self,
        org_id: &str,
        ids: &[String],
    ) -> Result<Vec<CustomerRef>, StoreError> {
        let customers = self.customers.read().await;
        Ok(customers
            .iter()
            .filter(|c| c.org_id == org_id && ids.contains(&c.id))
            .map(|c| CustomerRef {
                id: c.id.clone(),
                name: c.name.clone(),
                email: c.email.clone(),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceStatus, LineItem};
    use crate::services::store::TimeRange;
    use chrono::{Duration, TimeZone, Utc};

    fn invoice(id: &str, customer: &str, total: f64, status: InvoiceStatus) -> Invoice {
        let created = Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap();
        Invoice {
            id: id.to_string(),
            org_id: "org-1".to_string(),
            customer_id: customer.to_string(),
            invoice_number: format!("INV-{}", id),
            status,
            items: vec![],
            tax_amount: 0.0,
            discount_amount: 0.0,
            total,
            issue_date: created,
            due_date: created + Duration::days(14),
            created_at: created,
            updated_at: created,
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn groups_by_status_within_org() {
        let store = InMemoryRecordStore::new();
        store
            .insert_invoice(invoice("1", "c1", 100.0, InvoiceStatus::Paid))
            .await;
        store
            .insert_invoice(invoice("2", "c1", 50.0, InvoiceStatus::Paid))
            .await;
        store
            .insert_invoice(invoice("3", "c2", 70.0, InvoiceStatus::Sent))
            .await;
        let mut foreign = invoice("4", "c9", 999.0, InvoiceStatus::Paid);
        foreign.org_id = "org-2".to_string();
        store.insert_invoice(foreign).await;

        let groups = store
            .group_invoices(
                &InvoiceFilter::for_org("org-1"),
                &GroupSpec::by(GroupKey::Status),
            )
            .await
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, GroupValue::Status(InvoiceStatus::Sent));
        assert_eq!(groups[0].totals.pending_total, 70.0);
        assert_eq!(groups[1].key, GroupValue::Status(InvoiceStatus::Paid));
        assert_eq!(groups[1].totals.total, 150.0);
        assert_eq!(groups[1].totals.paid_count, 2);
    }

    #[tokio::test]
    async fn line_items_count_distinct_invoices() {
        let store = InMemoryRecordStore::new();
        let mut first = invoice("1", "c1", 100.0, InvoiceStatus::Paid);
        first.items = vec![
            LineItem::new("Printing", 1.0, 60.0),
            LineItem::new("Printing", 1.0, 40.0),
        ];
        let mut second = invoice("2", "c1", 50.0, InvoiceStatus::Paid);
        second.items = vec![LineItem::new("Printing", 2.0, 25.0)];
        store.insert_invoice(first).await;
        store.insert_invoice(second).await;

        let groups = store
            .group_line_items(&InvoiceFilter::for_org("org-1"), 15)
            .await
            .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].total_amount, 150.0);
        assert_eq!(groups[0].total_quantity, 4.0);
        assert_eq!(groups[0].invoice_count, 2);
        assert!((groups[0].average_rate - 125.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn created_range_excludes_upper_bound() {
        let store = InMemoryRecordStore::new();
        let inv = invoice("1", "c1", 10.0, InvoiceStatus::Sent);
        let created = inv.created_at;
        store.insert_invoice(inv).await;

        let filter = InvoiceFilter::for_org("org-1")
            .created_in(TimeRange::between(created - Duration::days(1), created));
        let groups = store
            .group_invoices(&filter, &GroupSpec::by(GroupKey::All))
            .await
            .unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn recent_invoices_resolve_customers() {
        let store = InMemoryRecordStore::new();
        store
            .insert_customer(Customer {
                id: "c1".to_string(),
                org_id: "org-1".to_string(),
                name: "Acme Print".to_string(),
                email: "billing@acme.test".to_string(),
                outstanding_balance: 0.0,
                is_active: true,
            })
            .await;
        let older = invoice("1", "c1", 10.0, InvoiceStatus::Sent);
        let mut newer = invoice("2", "c2", 20.0, InvoiceStatus::Sent);
        newer.created_at = older.created_at + Duration::hours(1);
        store.insert_invoice(older).await;
        store.insert_invoice(newer).await;

        let recent = store.find_recent_invoices("org-1", 10).await.unwrap();

        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "2");
        assert_eq!(recent[0].customer_name, None);
        assert_eq!(recent[1].customer_name.as_deref(), Some("Acme Print"));
    }
}
