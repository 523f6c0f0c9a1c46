//! Client context for telemetry batches.

use crate::models::ClientContext;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};
use std::convert::Infallible;

pub const SESSION_ID_HEADER: &str = "X-Session-ID";
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First address of an `X-Forwarded-For` chain.
pub fn first_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    header_value(headers, FORWARDED_FOR_HEADER)?
        .split(',')
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .map(str::to_string)
}

pub fn client_context(headers: &HeaderMap) -> ClientContext {
    ClientContext {
        user_agent: header_value(headers, header::USER_AGENT.as_str()),
        referrer: header_value(headers, header::REFERER.as_str()),
        session_id: header_value(headers, SESSION_ID_HEADER),
        client_ip: first_forwarded_ip(headers),
    }
}

/// Extractor wrapper around [`ClientContext`].
#[derive(Debug, Clone)]
pub struct ClientInfo(pub ClientContext);

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientInfo(client_context(&parts.headers)))
    }
}
