//! MongoDB record store.
//!
//! Translates the declarative group specifications into aggregation pipelines
//! over the `invoices` and `customers` collections written by the invoicing
//! application.

use crate::models::{Customer, Invoice, InvoiceStatus};
use crate::services::buckets::{mean, AgingBucket, CalendarKey, DelayBucket, MS_PER_DAY};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    order_groups, order_line_items, CustomerRef, CustomerSummary, Granularity, GroupKey,
    GroupOrder, GroupSpec, GroupValue, InvoiceFilter, InvoiceGroup, InvoiceTotals,
    LineItemGroup, RecentInvoice, RecordStore, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    options::{AggregateOptions, ClientOptions, FindOptions, IndexOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use secrecy::{ExposeSecret, Secret};
use std::future::Future;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct MongoRecordStore {
    client: MongoClient,
    db: Database,
    timeout: Duration,
}

impl MongoRecordStore {
    pub async fn connect(
        uri: &Secret<String>,
        database: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(uri.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!("Failed to parse MongoDB connection string: {}", e);
                StoreError::Query(e.to_string())
            })?;
        options.app_name = Some("analytics-service".to_string());
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);

        let client = MongoClient::with_options(options).map_err(|e| {
            tracing::error!("Failed to create MongoDB client: {}", e);
            StoreError::Query(e.to_string())
        })?;
        let db = client.database(database);
        info!(database = %database, "MongoDB record store ready");

        Ok(Self {
            client,
            db,
            timeout,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn invoices(&self) -> Collection<Invoice> {
        self.db.collection("invoices")
    }

    pub fn customers(&self) -> Collection<Customer> {
        self.db.collection("customers")
    }

    /// Ensure the tenant-scoped indexes the aggregations rely on.
    pub async fn initialize_indexes(&self) -> Result<(), StoreError> {
        let tenant_created = IndexModel::builder()
            .keys(doc! { "org_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_created_idx".to_string())
                    .build(),
            )
            .build();

        let tenant_status = IndexModel::builder()
            .keys(doc! { "org_id": 1, "status": 1, "due_date": 1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_status_due_idx".to_string())
                    .build(),
            )
            .build();

        let tenant_customer = IndexModel::builder()
            .keys(doc! { "org_id": 1, "customer_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_customer_idx".to_string())
                    .build(),
            )
            .build();

        self.invoices()
            .create_indexes([tenant_created, tenant_status, tenant_customer], None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create invoice indexes: {}", e);
                StoreError::Query(e.to_string())
            })?;

        let customer_tenant = IndexModel::builder()
            .keys(doc! { "org_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("tenant_customer_org_idx".to_string())
                    .build(),
            )
            .build();

        self.customers()
            .create_indexes([customer_tenant], None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create customer indexes: {}", e);
                StoreError::Query(e.to_string())
            })?;

        info!("Analytics indexes initialized");
        Ok(())
    }

    fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions::builder().max_time(self.timeout).build()
    }

    /// Run a store call under the configured timeout and record its duration.
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        timer.observe_duration();
        if let Err(e) = &result {
            tracing::error!(operation = %operation, error = %e, "Record store call failed");
        }
        result
    }

    async fn run_pipeline(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>, StoreError> {
        let cursor = self
            .db
            .collection::<Document>(collection)
            .aggregate(pipeline, self.aggregate_options())
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

fn bson_date(instant: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_chrono(instant)
}

pub(crate) fn match_stage(filter: &InvoiceFilter) -> Document {
    let mut stage = doc! { "org_id": &filter.org_id };

    if let Some(range) = filter.created {
        let mut created = doc! { "$gte": bson_date(range.from) };
        if let Some(to) = range.to {
            created.insert("$lt", bson_date(to));
        }
        stage.insert("created_at", created);
    }

    if let Some(statuses) = &filter.statuses {
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        stage.insert("status", doc! { "$in": values });
    }

    if let Some(instant) = filter.due_before {
        stage.insert("due_date", doc! { "$lt": bson_date(instant) });
    }

    doc! { "$match": stage }
}

fn days_since_due(reference: Bson) -> Bson {
    Bson::Document(doc! {
        "$divide": [ { "$subtract": [reference, "$due_date"] }, MS_PER_DAY ]
    })
}

fn settled_delay_days() -> Bson {
    days_since_due(Bson::Document(
        doc! { "$ifNull": ["$paid_at", "$updated_at"] },
    ))
}

fn switch_on(days: Bson, edges: &[(f64, &str)], fallback: &str) -> Bson {
    let branches: Vec<Document> = edges
        .iter()
        .map(|(edge, label)| doc! { "case": { "$lte": [days.clone(), *edge] }, "then": *label })
        .collect();
    Bson::Document(doc! { "$switch": { "branches": branches, "default": fallback } })
}

pub(crate) fn group_id(key: &GroupKey) -> Bson {
    match key {
        GroupKey::All => Bson::Null,
        GroupKey::Status => Bson::String("$status".to_string()),
        GroupKey::Customer => Bson::String("$customer_id".to_string()),
        GroupKey::Calendar(granularity) => {
            let mut id = doc! {
                "year": { "$year": "$created_at" },
                "month": { "$month": "$created_at" },
            };
            match granularity {
                Granularity::Month => {}
                Granularity::Week => {
                    id.insert("week", doc! { "$isoWeek": "$created_at" });
                }
                Granularity::Day => {
                    id.insert("day", doc! { "$dayOfMonth": "$created_at" });
                }
            }
            Bson::Document(id)
        }
        GroupKey::Quarter => Bson::Document(doc! {
            "$toInt": { "$ceil": { "$divide": [ { "$month": "$created_at" }, 3 ] } }
        }),
        GroupKey::OverdueAge { as_of } => switch_on(
            days_since_due(Bson::DateTime(bson_date(*as_of))),
            &[
                (30.0, AgingBucket::UpTo30.label()),
                (60.0, AgingBucket::UpTo60.label()),
                (90.0, AgingBucket::UpTo90.label()),
            ],
            AgingBucket::Over90.label(),
        ),
        GroupKey::PaymentDelay => switch_on(
            settled_delay_days(),
            &[
                (0.0, DelayBucket::OnTime.label()),
                (7.0, DelayBucket::UpTo7.label()),
                (30.0, DelayBucket::UpTo30.label()),
            ],
            DelayBucket::Over30.label(),
        ),
    }
}

fn status_is(status: InvoiceStatus) -> Document {
    doc! { "$eq": ["$status", status.as_str()] }
}

pub(crate) fn group_stage(key: &GroupKey) -> Document {
    let paid = status_is(InvoiceStatus::Paid);
    doc! {
        "$group": {
            "_id": group_id(key),
            "count": { "$sum": 1 },
            "total": { "$sum": "$total" },
            "paid_total": { "$sum": { "$cond": [paid.clone(), "$total", 0] } },
            "paid_count": { "$sum": { "$cond": [paid.clone(), 1, 0] } },
            "pending_total": { "$sum": { "$cond": [status_is(InvoiceStatus::Sent), "$total", 0] } },
            "overdue_total": { "$sum": { "$cond": [status_is(InvoiceStatus::Overdue), "$total", 0] } },
            "last_invoice_at": { "$max": "$created_at" },
            "delay_days_sum": { "$sum": { "$cond": [paid, settled_delay_days(), 0] } },
        }
    }
}

pub(crate) fn invoice_pipeline(filter: &InvoiceFilter, spec: &GroupSpec) -> Vec<Document> {
    let mut pipeline = vec![match_stage(filter), group_stage(&spec.key)];
    match spec.order {
        GroupOrder::KeyAscending => pipeline.push(doc! { "$sort": { "_id": 1 } }),
        GroupOrder::TotalDescending => pipeline.push(doc! { "$sort": { "total": -1, "_id": 1 } }),
    }
    if let Some(limit) = spec.limit {
        pipeline.push(doc! { "$limit": limit as i64 });
    }
    pipeline
}

fn get_f64(doc: &Document, field: &str) -> Result<f64, StoreError> {
    match doc.get(field) {
        Some(Bson::Double(v)) => Ok(*v),
        Some(Bson::Int32(v)) => Ok(*v as f64),
        Some(Bson::Int64(v)) => Ok(*v as f64),
        Some(Bson::Null) | None => Ok(0.0),
        Some(other) => Err(StoreError::Decode(format!(
            "field '{}' is not numeric: {:?}",
            field, other
        ))),
    }
}

fn get_u64(doc: &Document, field: &str) -> Result<u64, StoreError> {
    get_f64(doc, field).map(|v| v.max(0.0) as u64)
}

fn get_u32(doc: &Document, field: &str) -> Result<u32, StoreError> {
    get_f64(doc, field).map(|v| v.max(0.0) as u32)
}

fn get_string(doc: &Document, field: &str) -> Result<String, StoreError> {
    doc.get_str(field)
        .map(|s| s.to_string())
        .map_err(|e| StoreError::Decode(format!("field '{}': {}", field, e)))
}

fn get_date(doc: &Document, field: &str) -> Option<DateTime<Utc>> {
    match doc.get(field) {
        Some(Bson::DateTime(d)) => Some(d.to_chrono()),
        _ => None,
    }
}

fn decode_key(key: &GroupKey, doc: &Document) -> Result<GroupValue, StoreError> {
    let unknown = |what: &str| StoreError::Decode(format!("unexpected {} group id: {:?}", what, doc.get("_id")));
    Ok(match key {
        GroupKey::All => GroupValue::All,
        GroupKey::Status => {
            let raw = get_string(doc, "_id")?;
            GroupValue::Status(InvoiceStatus::from_string(&raw).ok_or_else(|| unknown("status"))?)
        }
        GroupKey::Customer => GroupValue::Customer(get_string(doc, "_id")?),
        GroupKey::Calendar(granularity) => {
            let id = doc.get_document("_id").map_err(|_| unknown("calendar"))?;
            GroupValue::Calendar(CalendarKey {
                year: get_f64(id, "year")? as i32,
                month: get_u32(id, "month")?,
                week: match granularity {
                    Granularity::Week => Some(get_u32(id, "week")?),
                    _ => None,
                },
                day: match granularity {
                    Granularity::Day => Some(get_u32(id, "day")?),
                    _ => None,
                },
            })
        }
        GroupKey::Quarter => GroupValue::Quarter(get_u32(doc, "_id")?),
        GroupKey::OverdueAge { .. } => GroupValue::Aging(
            AgingBucket::from_label(&get_string(doc, "_id")?).ok_or_else(|| unknown("aging"))?,
        ),
        GroupKey::PaymentDelay => GroupValue::Delay(
            DelayBucket::from_label(&get_string(doc, "_id")?).ok_or_else(|| unknown("delay"))?,
        ),
    })
}

fn decode_group(key: &GroupKey, doc: &Document) -> Result<InvoiceGroup, StoreError> {
    Ok(InvoiceGroup {
        key: decode_key(key, doc)?,
        totals: InvoiceTotals {
            count: get_u64(doc, "count")?,
            total: get_f64(doc, "total")?,
            paid_total: get_f64(doc, "paid_total")?,
            paid_count: get_u64(doc, "paid_count")?,
            pending_total: get_f64(doc, "pending_total")?,
            overdue_total: get_f64(doc, "overdue_total")?,
            last_invoice_at: get_date(doc, "last_invoice_at"),
            delay_days_sum: get_f64(doc, "delay_days_sum")?,
        },
    })
}

/// Customers without a balance count as zero, so the average is taken over
/// every customer rather than with `$avg`.
fn decode_customer_summary(doc: &Document) -> Result<CustomerSummary, StoreError> {
    let total_customers = get_u64(doc, "total_customers")?;
    let total_outstanding = get_f64(doc, "total_outstanding")?;
    Ok(CustomerSummary {
        total_customers,
        active_customers: get_u64(doc, "active_customers")?,
        total_outstanding,
        average_outstanding: mean(total_outstanding, total_customers),
    })
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    #[instrument(skip(self, filter), fields(org_id = %filter.org_id, key = ?spec.key))]
    async fn group_invoices(
        &self,
        filter: &InvoiceFilter,
        spec: &GroupSpec,
    ) -> Result<Vec<InvoiceGroup>, StoreError> {
        self.bounded("group_invoices", async {
            let docs = self
                .run_pipeline("invoices", invoice_pipeline(filter, spec))
                .await?;
            let mut groups = docs
                .iter()
                .map(|doc| decode_group(&spec.key, doc))
                .collect::<Result<Vec<_>, _>>()?;
            // Mongo orders status strings alphabetically; re-apply the shared ordering.
            order_groups(&mut groups, spec);
            Ok(groups)
        })
        .await
    }

    #[instrument(skip(self, filter), fields(org_id = %filter.org_id))]
    async fn group_line_items(
        &self,
        filter: &InvoiceFilter,
        limit: usize,
    ) -> Result<Vec<LineItemGroup>, StoreError> {
        self.bounded("group_line_items", async {
            let pipeline = vec![
                match_stage(filter),
                doc! { "$unwind": "$items" },
                doc! {
                    "$group": {
                        "_id": "$items.description",
                        "total_amount": { "$sum": "$items.amount" },
                        "total_quantity": { "$sum": "$items.quantity" },
                        "average_rate": { "$avg": "$items.rate" },
                        "invoices": { "$addToSet": "$_id" },
                    }
                },
                doc! {
                    "$project": {
                        "total_amount": 1,
                        "total_quantity": 1,
                        "average_rate": 1,
                        "invoice_count": { "$size": "$invoices" },
                    }
                },
                doc! { "$sort": { "total_amount": -1, "_id": 1 } },
                doc! { "$limit": limit as i64 },
            ];
            let docs = self.run_pipeline("invoices", pipeline).await?;
            let mut groups = docs
                .iter()
                .map(|doc| {
                    Ok(LineItemGroup {
                        description: get_string(doc, "_id")?,
                        total_amount: get_f64(doc, "total_amount")?,
                        total_quantity: get_f64(doc, "total_quantity")?,
                        average_rate: get_f64(doc, "average_rate")?,
                        invoice_count: get_u64(doc, "invoice_count")?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            order_line_items(&mut groups, limit);
            Ok(groups)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn find_recent_invoices(
        &self,
        org_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentInvoice>, StoreError> {
        self.bounded("find_recent_invoices", async {
            let pipeline = vec![
                doc! { "$match": { "org_id": org_id } },
                doc! { "$sort": { "created_at": -1, "_id": 1 } },
                doc! { "$limit": limit as i64 },
                doc! {
                    "$lookup": {
                        "from": "customers",
                        "let": { "cid": "$customer_id", "org": "$org_id" },
                        "pipeline": [
                            { "$match": { "$expr": { "$and": [
                                { "$eq": ["$_id", "$$cid"] },
                                { "$eq": ["$org_id", "$$org"] },
                            ] } } },
                            { "$project": { "name": 1, "email": 1 } },
                        ],
                        "as": "customer",
                    }
                },
                doc! { "$unwind": { "path": "$customer", "preserveNullAndEmptyArrays": true } },
            ];
            let docs = self.run_pipeline("invoices", pipeline).await?;
            docs.iter()
                .map(|doc| {
                    let customer = doc.get_document("customer").ok();
                    let status = get_string(doc, "status")?;
                    Ok(RecentInvoice {
                        id: get_string(doc, "_id")?,
                        invoice_number: doc.get_str("invoice_number").unwrap_or_default().to_string(),
                        customer_id: get_string(doc, "customer_id")?,
                        customer_name: customer
                            .and_then(|c| c.get_str("name").ok())
                            .map(|s| s.to_string()),
                        customer_email: customer
                            .and_then(|c| c.get_str("email").ok())
                            .map(|s| s.to_string()),
                        status: InvoiceStatus::from_string(&status).ok_or_else(|| {
                            StoreError::Decode(format!("unknown invoice status '{}'", status))
                        })?,
                        total: get_f64(doc, "total")?,
                        due_date: get_date(doc, "due_date").ok_or_else(|| {
                            StoreError::Decode("invoice without due_date".to_string())
                        })?,
                        created_at: get_date(doc, "created_at").ok_or_else(|| {
                            StoreError::Decode("invoice without created_at".to_string())
                        })?,
                    })
                })
                .collect()
        })
        .await
    }

    #[instrument(skip(self))]
    async fn customer_summary(&self, org_id: &str) -> Result<CustomerSummary, StoreError> {
        self.bounded("customer_summary", async {
            let pipeline = vec![
                doc! { "$match": { "org_id": org_id } },
                doc! {
                    "$group": {
                        "_id": Bson::Null,
                        "total_customers": { "$sum": 1 },
                        "active_customers": { "$sum": { "$cond": [ { "$ne": ["$is_active", false] }, 1, 0 ] } },
                        "total_outstanding": { "$sum": "$outstanding_balance" },
                    }
                },
            ];
            let docs = self.run_pipeline("customers", pipeline).await?;
            match docs.first() {
                Some(doc) => decode_customer_summary(doc),
                None => Ok(CustomerSummary::default()),
            }
        })
        .await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_customers(
        &self,
        org_id: &str,
        ids: &[String],
    ) -> Result<Vec<CustomerRef>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.bounded("find_customers", async {
            let options = FindOptions::builder().max_time(self.timeout).build();
            let cursor = self
                .customers()
                .find(doc! { "org_id": org_id, "_id": { "$in": ids.to_vec() } }, options)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let customers: Vec<Customer> = cursor
                .try_collect()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            Ok(customers
                .into_iter()
                .map(|c| CustomerRef {
                    id: c.id,
                    name: c.name,
                    email: c.email,
                })
                .collect())
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.bounded("health_check", async {
            self.client
                .database("admin")
                .run_command(doc! { "ping": 1 }, None)
                .await
                .map_err(|e| {
                    tracing::error!("MongoDB health check failed: {}", e);
                    StoreError::Query(e.to_string())
                })?;
            Ok(())
        })
        .await
    }
}
