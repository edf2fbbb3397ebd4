//! Request-signature validation middleware.
//!
//! Buffers the body, hands the signature headers to the verifier, and
//! attaches the verified device identity to the request. Every rejection
//! produces the same generic 401; the specific reason lives only in the
//! security event log.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::BodyExt;
use serde_json::json;

use service_core::error::AppError;

use crate::services::metrics::SIGNATURE_VALIDATIONS_TOTAL;
use crate::services::{RequestMeta, ServiceError, SignedRequest, VerifiedDevice};
use crate::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const DEVICE_ID_HEADER: &str = "X-Device-ID";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const NONCE_HEADER: &str = "X-Nonce";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Verified device identity attached to requests that passed signature
/// validation.
#[derive(Debug, Clone)]
pub struct DeviceIdentity(pub VerifiedDevice);

pub async fn signature_validation_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = req.uri().path();
    if is_excluded(&state, path) {
        return Ok(next.run(req).await);
    }

    // When signatures are optional, unsigned requests pass through; a
    // request that carries a signature header is still verified in full
    if !state.config.security.require_signatures
        && !req.headers().contains_key(SIGNATURE_HEADER)
    {
        return Ok(next.run(req).await);
    }

    let headers = req.headers().clone();
    let meta = request_meta(&headers, &req);
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let api_key = header_str(&headers, API_KEY_HEADER).unwrap_or_default();
    let device_id = header_str(&headers, DEVICE_ID_HEADER).unwrap_or_default();
    let nonce = header_str(&headers, NONCE_HEADER).unwrap_or_default();
    let signature = header_str(&headers, SIGNATURE_HEADER).unwrap_or_default();
    let timestamp: i64 = match header_str(&headers, TIMESTAMP_HEADER)
        .unwrap_or_default()
        .parse()
    {
        Ok(ts) => ts,
        Err(_) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid timestamp format"})),
            )
                .into_response());
        }
    };

    // Buffer the body so it can be verified and then replayed downstream
    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| {
            tracing::error!("Body read error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Failed to read body"})),
            )
                .into_response()
        })?
        .to_bytes();

    let body_str = if bytes.is_empty() {
        None
    } else {
        Some(std::str::from_utf8(&bytes).unwrap_or(""))
    };

    let signed = SignedRequest {
        api_key,
        device_id,
        method: &method,
        path: &path,
        timestamp,
        nonce,
        body: body_str,
        signature,
    };

    match state.verifier.verify(&signed, &meta).await {
        Ok(verified) => {
            if let Some(counter) = SIGNATURE_VALIDATIONS_TOTAL.get() {
                counter.with_label_values(&["success"]).inc();
            }
            let mut req = Request::from_parts(parts, Body::from(bytes));
            req.extensions_mut().insert(DeviceIdentity(verified));
            Ok(next.run(req).await)
        }
        Err(err) => {
            if let Some(counter) = SIGNATURE_VALIDATIONS_TOTAL.get() {
                counter.with_label_values(&["failure"]).inc();
            }
            Err(AppError::from(err).into_response())
        }
    }
}

fn is_excluded(state: &AppState, path: &str) -> bool {
    if path == "/health"
        || path == "/metrics"
        || path.starts_with("/docs")
        || path.starts_with("/.well-known")
    {
        return true;
    }
    state
        .config
        .security
        .excluded_paths
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub(crate) fn request_meta(headers: &HeaderMap, req: &Request) -> RequestMeta {
    let ip_address = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            req.extensions()
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    RequestMeta {
        ip_address,
        user_agent: header_str(headers, "user-agent").map(str::to_string),
        session_id: header_str(headers, "x-session-id").map(str::to_string),
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for DeviceIdentity
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<DeviceIdentity>().cloned().ok_or_else(|| {
            AppError::from(ServiceError::InvalidDevice).into_response()
        })
    }
}
