pub mod analytics;
pub mod health;
pub mod metrics;
pub mod telemetry;

pub use analytics::{get_overview, get_payment_delays, get_revenue_trends, invalidate_cache};
pub use health::{health_check, readiness_check};
pub use self::metrics::metrics_endpoint;
pub use telemetry::{get_metrics_snapshot, ingest_metrics};
