//! Invoice model as stored by the invoicing application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Viewed,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Viewed => "viewed",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(InvoiceStatus::Draft),
            "sent" => Some(InvoiceStatus::Sent),
            "viewed" => Some(InvoiceStatus::Viewed),
            "partially_paid" => Some(InvoiceStatus::PartiallyPaid),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line item on an invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub rate: f64,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_charge: Option<f64>,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: f64, rate: f64) -> Self {
        Self {
            description: description.into(),
            quantity,
            rate,
            amount: quantity * rate,
            service_charge: None,
        }
    }
}

/// Invoice document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(rename = "_id")]
    pub id: String,
    pub org_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub invoice_number: String,
    pub status: InvoiceStatus,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default)]
    pub discount_amount: f64,
    pub total: f64,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub issue_date: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub due_date: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Total recomputed from line items, service charges, tax and discount.
    pub fn computed_total(&self) -> f64 {
        let items: f64 = self
            .items
            .iter()
            .map(|item| item.amount + item.service_charge.unwrap_or(0.0))
            .sum();
        items + self.tax_amount - self.discount_amount
    }

    /// Timestamp the invoice was settled. Records written before `paid_at`
    /// existed fall back to the last update.
    pub fn settled_at(&self) -> DateTime<Utc> {
        self.paid_at.unwrap_or(self.updated_at)
    }
}

// Helper module for optional DateTime<Utc> as BSON DateTime
mod opt_chrono_datetime_as_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => bson::DateTime::from_chrono(*d).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt.map(|d| d.to_chrono()))
    }
}
