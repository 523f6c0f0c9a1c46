pub mod analytics;
pub mod telemetry;

pub use analytics::{
    status_distribution, trend_cache_params, OverviewResponse, RevenueParams,
    StatusDistributionEntry, WindowParams,
};
pub use telemetry::{parse_samples, MetricsSnapshotResponse};
