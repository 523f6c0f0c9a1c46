pub mod buckets;
pub mod cache;
pub mod engine;
pub mod memory_store;
pub mod metrics;
pub mod mongo_store;
pub mod rollup;
pub mod store;

pub use cache::{AnalyticsCache, InMemoryCache, NoopCache, RedisCache};
pub use engine::{AnalyticsEngine, AnalyticsError, TrendPeriod, TrendQuery};
pub use memory_store::InMemoryRecordStore;
pub use self::metrics::{get_metrics, init_metrics};
pub use mongo_store::MongoRecordStore;
pub use rollup::{IngestOutcome, MetricsRegistry};
pub use store::{RecordStore, StoreError};
