//! Device lifecycle handlers.

use service_core::{
    axum::{
        extract::{ConnectInfo, Path, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        Json,
    },
    error::AppError,
};
use std::net::SocketAddr;

use crate::{
    dtos::{
        device::{
            RegisterDeviceRequest, RegisterDeviceResponse, TrustDeviceRequest,
            TrustDeviceResponse,
        },
        ErrorResponse, MessageResponse,
    },
    handlers::request_meta,
    middleware::DeviceIdentity,
    models::DeviceResponse,
    utils::ValidatedJson,
    AppState,
};

/// Register a device and issue its signing secret
#[utoipa::path(
    post,
    path = "/devices/register",
    request_body = RegisterDeviceRequest,
    responses(
        (status = 201, description = "Device registered", body = RegisterDeviceResponse),
        (status = 400, description = "Invalid device id", body = ErrorResponse),
        (status = 401, description = "Invalid API key", body = ErrorResponse),
        (status = 409, description = "Duplicate device or device limit reached", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Devices"
)]
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<RegisterDeviceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let registered = state
        .devices
        .register(req.user_id, &req.device_id, req.device_info, &meta)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterDeviceResponse {
            device_id: registered.device_id,
            device_secret: registered.device_secret,
            trust_status: registered.trust_status,
        }),
    ))
}

/// List the caller's registered devices
#[utoipa::path(
    get,
    path = "/devices",
    responses(
        (status = 200, description = "Registered devices", body = [DeviceResponse]),
        (status = 401, description = "Security validation failed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Devices"
)]
pub async fn list_devices(
    State(state): State<AppState>,
    DeviceIdentity(identity): DeviceIdentity,
) -> Result<impl IntoResponse, AppError> {
    let devices = state.devices.list_devices(identity.user_id).await?;
    Ok(Json(devices))
}

/// Remove a device and revoke its tokens
#[utoipa::path(
    delete,
    path = "/devices/{device_id}",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Device removed", body = MessageResponse),
        (status = 401, description = "Security validation failed", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Devices"
)]
pub async fn remove_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    DeviceIdentity(identity): DeviceIdentity,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    state
        .devices
        .remove_device(identity.user_id, &device_id, &meta)
        .await?;
    Ok(Json(MessageResponse {
        message: "Device removed".to_string(),
    }))
}

/// Mark a device as trusted after secondary verification
#[utoipa::path(
    post,
    path = "/devices/{device_id}/trust",
    params(("device_id" = String, Path, description = "Device identifier")),
    request_body = TrustDeviceRequest,
    responses(
        (status = 200, description = "Device trusted", body = TrustDeviceResponse),
        (status = 401, description = "Security validation failed", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
        (status = 409, description = "Device already trusted", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Trust"
)]
pub async fn trust_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    DeviceIdentity(identity): DeviceIdentity,
    Path(device_id): Path<String>,
    Json(req): Json<TrustDeviceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    let grant = state
        .trust
        .trust_device(
            identity.user_id,
            &device_id,
            req.verification_method,
            req.trust_duration_seconds,
            &meta,
        )
        .await?;

    Ok(Json(TrustDeviceResponse {
        trust_status: grant.trust_status,
        trusted_until: grant.trusted_until,
    }))
}

/// Revoke trust from a device
#[utoipa::path(
    delete,
    path = "/devices/{device_id}/trust",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Trust revoked", body = MessageResponse),
        (status = 401, description = "Security validation failed", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Trust"
)]
pub async fn untrust_device(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    DeviceIdentity(identity): DeviceIdentity,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let meta = request_meta(&headers, addr);
    state
        .trust
        .revoke_trust(identity.user_id, &device_id, &meta)
        .await?;
    Ok(Json(MessageResponse {
        message: "Trust revoked".to_string(),
    }))
}
