use crate::config::{AnalyticsConfig, CacheConfig, RedisConfig, StoreBackend};
use crate::handlers;
use crate::services::cache::spawn_purge_task;
use crate::services::{
    init_metrics, AnalyticsCache, AnalyticsEngine, InMemoryCache, InMemoryRecordStore,
    MetricsRegistry, MongoRecordStore, NoopCache, RecordStore, RedisCache,
};
use axum::{
    body::Body,
    middleware::from_fn,
    routing::{delete, get},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{make_request_span, metrics_middleware, request_id_middleware};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: AnalyticsConfig,
    pub engine: AnalyticsEngine,
    pub cache: Arc<dyn AnalyticsCache>,
    pub registry: MetricsRegistry,
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    pub async fn build(config: AnalyticsConfig) -> Result<Self, AppError> {
        let store: Arc<dyn RecordStore> = match config.store.backend {
            StoreBackend::Mongo => {
                let store = MongoRecordStore::connect(
                    &config.mongodb.uri,
                    &config.mongodb.database,
                    config.store.timeout(),
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to MongoDB: {}", e);
                    AppError::DatabaseError(anyhow::Error::new(e))
                })?;
                store.initialize_indexes().await.map_err(|e| {
                    tracing::error!("Failed to initialize database indexes: {}", e);
                    AppError::DatabaseError(anyhow::Error::new(e))
                })?;
                Arc::new(store)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using the in-memory record store; analytics will be empty");
                Arc::new(InMemoryRecordStore::new())
            }
        };

        Self::build_with_store(config, store).await
    }

    /// Build around an existing record store.
    pub async fn build_with_store(
        config: AnalyticsConfig,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let cache = build_cache(&config.cache, config.redis.as_ref()).await;

        let state = AppState {
            config: config.clone(),
            engine: AnalyticsEngine::new(store),
            cache,
            registry: MetricsRegistry::new(),
        };

        let app = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route("/analytics/overview", get(handlers::get_overview))
            .route("/analytics/revenue", get(handlers::get_revenue_trends))
            .route("/analytics/payment-delays", get(handlers::get_payment_delays))
            .route("/analytics/cache", delete(handlers::invalidate_cache))
            .route(
                "/telemetry/metrics",
                get(handlers::get_metrics_snapshot).post(handlers::ingest_metrics),
            )
            // MatchedPath is only visible to route layers.
            .route_layer(from_fn(metrics_middleware))
            .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<Body>))
            .layer(from_fn(request_id_middleware))
            .with_state(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Listening on {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

async fn build_cache(
    config: &CacheConfig,
    redis: Option<&RedisConfig>,
) -> Arc<dyn AnalyticsCache> {
    if !config.enabled {
        tracing::info!("Analytics cache disabled");
        return Arc::new(NoopCache);
    }

    if let Some(redis) = redis {
        match RedisCache::connect(redis.url.expose_secret()).await {
            Ok(cache) => return Arc::new(cache),
            Err(e) => tracing::warn!("Redis cache unavailable, using in-memory cache: {}", e),
        }
    }

    let cache: Arc<dyn AnalyticsCache> = Arc::new(InMemoryCache::new());
    spawn_purge_task(cache.clone(), config.purge_interval());
    cache
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
