//! Token issuance, refresh, introspection and revocation handlers.

use service_core::{
    axum::{
        extract::{ConnectInfo, State},
        http::{header, HeaderMap},
        response::IntoResponse,
        Json,
    },
    error::AppError,
};
use std::net::SocketAddr;

use crate::{
    dtos::{
        token::{LongTermTokenResponse, RefreshRequest, RevokeTokensResponse},
        ErrorResponse,
    },
    handlers::request_meta,
    middleware::{BearerToken, DeviceIdentity},
    services::metrics::TOKENS_ISSUED_TOTAL,
    services::{RegistryInfo, TokenPair, TokenValidation},
    utils::ValidatedJson,
    AppState,
};

fn count_issued(kind: &str) {
    if let Some(counter) = TOKENS_ISSUED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

/// Issue a fresh access/refresh pair for the calling device
#[utoipa::path(
    post,
    path = "/tokens/generate",
    responses(
        (status = 200, description = "Token pair issued", body = TokenPair),
        (status = 401, description = "Security validation failed", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens"
)]
pub async fn generate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    DeviceIdentity(identity): DeviceIdentity,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let pair = state
        .tokens
        .generate_tokens(identity.user_id, &identity.device_id, &meta)
        .await?;
    count_issued("access");
    count_issued("refresh");
    Ok(Json(pair))
}

/// Exchange a refresh token for a new pair
///
/// The token must be bound to the device that signed this request.
#[utoipa::path(
    post,
    path = "/tokens/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse),
        (status = 403, description = "Token missing refresh ability", body = ErrorResponse),
        (status = 429, description = "Refreshed too frequently", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    DeviceIdentity(identity): DeviceIdentity,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let pair = state
        .tokens
        .refresh_tokens(&req.refresh_token, &identity.device_id, &meta)
        .await?;
    count_issued("access");
    count_issued("refresh");
    Ok(Json(pair))
}

/// Issue a long-term limited token (trusted devices only)
#[utoipa::path(
    post,
    path = "/tokens/long-term",
    responses(
        (status = 200, description = "Long-term token issued", body = LongTermTokenResponse),
        (status = 401, description = "Security validation failed", body = ErrorResponse),
        (status = 403, description = "Device is not trusted", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens"
)]
pub async fn long_term(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    DeviceIdentity(identity): DeviceIdentity,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let (token, expires_at) = state
        .tokens
        .issue_long_term(identity.user_id, &identity.device_id, &meta)
        .await?;
    count_issued("long_term");
    Ok(Json(LongTermTokenResponse { token, expires_at }))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Introspect the presented bearer token
///
/// Always 200 for a well-formed request; expired or unknown tokens come back
/// with `valid: false` rather than an error, so clients can distinguish
/// "renew me" from transport failures. For that reason this route sits
/// outside the strict bearer middleware, which would 401 on exactly the
/// tokens it needs to describe.
#[utoipa::path(
    get,
    path = "/tokens/validate",
    responses(
        (status = 200, description = "Introspection result", body = TokenValidation),
        (status = 400, description = "Missing bearer token", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens",
    security(("bearer_auth" = []))
)]
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let token = bearer(&headers).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Missing Authorization bearer token"))
    })?;
    let validation = state.tokens.validate_token(token).await?;
    Ok(Json(validation))
}

/// Report whether the presented token is due for rotation
///
/// Like `/tokens/validate`, this answers 200 for expired or unknown tokens
/// and therefore sits outside the strict bearer middleware.
#[utoipa::path(
    get,
    path = "/tokens/should-rotate",
    responses(
        (status = 200, description = "Rotation advice", body = TokenValidation),
        (status = 400, description = "Missing bearer token", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens",
    security(("bearer_auth" = []))
)]
pub async fn should_rotate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let token = bearer(&headers).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Missing Authorization bearer token"))
    })?;
    let validation = state.tokens.validate_token(token).await?;
    Ok(Json(serde_json::json!({
        "should_rotate": validation.should_rotate,
        "valid": validation.valid,
        "expires_at": validation.expires_at,
    })))
}

/// Registry status for the authenticated device's token pair
#[utoipa::path(
    get,
    path = "/tokens/info",
    responses(
        (status = 200, description = "Registry pair status", body = RegistryInfo),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens",
    security(("bearer_auth" = []))
)]
pub async fn info(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    let info = state
        .tokens
        .registry_info(token.user_id, &token.device_id)
        .await?;
    Ok(Json(info))
}

/// Revoke every token for the authenticated device
#[utoipa::path(
    delete,
    path = "/tokens/device",
    responses(
        (status = 200, description = "Tokens revoked", body = RevokeTokensResponse),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens",
    security(("bearer_auth" = []))
)]
pub async fn revoke_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let revoked = state
        .tokens
        .revoke_device_tokens(token.user_id, &token.device_id, &meta)
        .await?;
    Ok(Json(RevokeTokensResponse {
        tokens_revoked: revoked,
    }))
}

/// Revoke every token for the authenticated user across all devices
#[utoipa::path(
    delete,
    path = "/tokens/all",
    responses(
        (status = 200, description = "Tokens revoked", body = RevokeTokensResponse),
        (status = 401, description = "Invalid or expired token", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Tokens",
    security(("bearer_auth" = []))
)]
pub async fn revoke_all(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let revoked = state.tokens.revoke_all_tokens(token.user_id, &meta).await?;
    Ok(Json(RevokeTokensResponse {
        tokens_revoked: revoked,
    }))
}
