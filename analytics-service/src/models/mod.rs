pub mod customer;
pub mod invoice;
pub mod metric;

pub use customer::Customer;
pub use invoice::{Invoice, InvoiceStatus, LineItem};
pub use metric::{ClientContext, MetricAggregate, MetricSample, RECENT_WINDOW};
