//! Shared mobile API key gate.
//!
//! Covers the registration route, which cannot be signature-validated
//! because the caller has no device secret yet.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use service_core::error::AppError;

use crate::middleware::signature::{request_meta, API_KEY_HEADER};
use crate::models::{SecurityEvent, SecurityEventType};
use crate::services::ServiceError;
use crate::AppState;

pub async fn api_key_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let expected = state.config.security.mobile_api_key.as_bytes();
    if provided.as_bytes().ct_eq(expected).unwrap_u8() == 0 {
        let meta = request_meta(&req.headers().clone(), &req);
        state.events.log_async(
            SecurityEvent::new(
                SecurityEventType::ApiKeyValidationFailed,
                0.6,
                meta.ip_address,
            )
            .context(serde_json::json!({ "path": req.uri().path() })),
        );
        return Err(AppError::from(ServiceError::InvalidApiKey).into_response());
    }

    Ok(next.run(req).await)
}
