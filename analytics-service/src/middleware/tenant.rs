//! Tenant context extracted from gateway headers.
//!
//! The upstream gateway authenticates the caller and forwards the
//! organization (and optionally the user) as headers. Every analytics query
//! is scoped by the organization taken from here.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const ORG_ID_HEADER: &str = "X-Org-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub org_id: String,
    pub user_id: Option<String>,
}

impl TenantContext {
    pub fn new(org_id: String, user_id: Option<String>) -> Self {
        Self { org_id, user_id }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = parts
            .headers
            .get(ORG_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::AuthError(anyhow::anyhow!(
                    "Missing X-Org-ID header (required from gateway)"
                ))
            })?;

        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        tracing::Span::current().record("org_id", org_id);

        Ok(TenantContext::new(org_id.to_string(), user_id))
    }
}
