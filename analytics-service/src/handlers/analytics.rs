use crate::dtos::{trend_cache_params, OverviewResponse, RevenueParams, WindowParams};
use crate::middleware::TenantContext;
use crate::services::cache::{cache_key, get_json, org_tag, set_json};
use crate::services::metrics::CACHE_LOOKUPS_TOTAL;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use validator::Validate;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

async fn cache_lookup(state: &AppState, key: &str) -> Option<Value> {
    match get_json::<Value>(state.cache.as_ref(), key).await {
        Ok(Some(value)) => {
            CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
            Some(value)
        }
        Ok(None) => {
            CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
            None
        }
        Err(e) => {
            CACHE_LOOKUPS_TOTAL.with_label_values(&["error"]).inc();
            tracing::warn!(key, "Cache lookup failed, computing: {}", e);
            None
        }
    }
}

async fn cache_fill(state: &AppState, key: &str, org_id: &str, value: &Value) {
    let tags = [org_tag(org_id)];
    if let Err(e) = set_json(
        state.cache.as_ref(),
        key,
        value,
        state.config.cache.ttl(),
        &tags,
    )
    .await
    {
        tracing::warn!(key, "Cache fill failed: {}", e);
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::InternalError(anyhow::Error::new(e)))
}

fn cached_response(body: Value, hit: bool) -> Response {
    let status = if hit { "hit" } else { "miss" };
    ([(CACHE_STATUS_HEADER, status)], Json(body)).into_response()
}

#[tracing::instrument(skip_all, fields(org_id = %tenant.org_id))]
pub async fn get_overview(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(params): Query<WindowParams>,
) -> Result<Response, AppError> {
    params.validate()?;

    let key = cache_key(&tenant.org_id, "overview", &params.cache_params());
    if let Some(body) = cache_lookup(&state, &key).await {
        return Ok(cached_response(body, true));
    }

    let overview = state
        .engine
        .compute_overview(&tenant.org_id, params.days())
        .await?;
    let body = to_json(&OverviewResponse::from(overview))?;

    cache_fill(&state, &key, &tenant.org_id, &body).await;
    Ok(cached_response(body, false))
}

#[tracing::instrument(skip_all, fields(org_id = %tenant.org_id))]
pub async fn get_revenue_trends(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(params): Query<RevenueParams>,
) -> Result<Response, AppError> {
    params.validate()?;
    let query = params.to_query(Utc::now())?;

    let key = cache_key(&tenant.org_id, "revenue", &trend_cache_params(&query));
    if let Some(body) = cache_lookup(&state, &key).await {
        return Ok(cached_response(body, true));
    }

    let trends = state
        .engine
        .compute_revenue_trends(&tenant.org_id, &query)
        .await?;
    let body = to_json(&trends)?;

    cache_fill(&state, &key, &tenant.org_id, &body).await;
    Ok(cached_response(body, false))
}

#[tracing::instrument(skip_all, fields(org_id = %tenant.org_id))]
pub async fn get_payment_delays(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(params): Query<WindowParams>,
) -> Result<impl IntoResponse, AppError> {
    params.validate()?;

    let report = state
        .engine
        .compute_payment_delays(&tenant.org_id, params.days())
        .await?;
    Ok(Json(report))
}

/// Drop every cached result of the caller's organization. Called by the
/// invoicing application after it mutates invoices or customers.
#[tracing::instrument(skip_all, fields(org_id = %tenant.org_id))]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<impl IntoResponse, AppError> {
    let removed = state
        .cache
        .invalidate_tag(&org_tag(&tenant.org_id))
        .await
        .map_err(|e| {
            tracing::error!("Cache invalidation failed: {}", e);
            AppError::ServiceUnavailable
        })?;

    tracing::info!(removed, user_id = ?tenant.user_id, "Analytics cache invalidated");
    Ok(Json(json!({ "invalidated": removed })))
}
