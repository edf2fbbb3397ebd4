pub mod devices;
pub mod metrics;
pub mod tokens;

use axum::http::HeaderMap;
use std::net::SocketAddr;

use crate::services::RequestMeta;

/// Build request metadata for event logging from handler-visible inputs.
pub(crate) fn request_meta(headers: &HeaderMap, addr: SocketAddr) -> RequestMeta {
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string());

    RequestMeta {
        ip_address,
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        session_id: headers
            .get("x-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}
