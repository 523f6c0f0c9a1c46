use crate::dtos::{parse_samples, MetricsSnapshotResponse};
use crate::middleware::ClientInfo;
use crate::startup::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::Value;
use service_core::error::AppError;

#[tracing::instrument(skip_all)]
pub async fn ingest_metrics(
    State(state): State<AppState>,
    ClientInfo(context): ClientInfo,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let samples = parse_samples(&body, &context, Utc::now())?;
    let outcome = state.registry.ingest(samples)?;
    Ok(Json(outcome))
}

pub async fn get_metrics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.registry.snapshot();
    Json(MetricsSnapshotResponse {
        metric_count: metrics.len(),
        metrics,
    })
}
