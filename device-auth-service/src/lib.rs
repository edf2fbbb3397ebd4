pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod migrations;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use service_core::middleware::{
    rate_limit::ip_rate_limit_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AuthConfig;
use crate::services::{
    Database, DeviceService, SecurityEventService, SignatureVerifier, TokenService, TrustService,
};
use service_core::error::AppError;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::devices::register,
        handlers::devices::list_devices,
        handlers::devices::remove_device,
        handlers::devices::trust_device,
        handlers::devices::untrust_device,
        handlers::tokens::generate,
        handlers::tokens::refresh,
        handlers::tokens::long_term,
        handlers::tokens::validate,
        handlers::tokens::should_rotate,
        handlers::tokens::info,
        handlers::tokens::revoke_device,
        handlers::tokens::revoke_all,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::device::RegisterDeviceRequest,
            dtos::device::RegisterDeviceResponse,
            dtos::device::TrustDeviceRequest,
            dtos::device::TrustDeviceResponse,
            dtos::token::RefreshRequest,
            dtos::token::LongTermTokenResponse,
            dtos::token::RevokeTokensResponse,
            models::DeviceResponse,
            models::TrustStatus,
            models::RegistryStatus,
            services::TokenPair,
            services::TokenValidation,
            services::RegistryInfo,
            services::VerificationMethod,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Devices", description = "Device registration and lifecycle"),
        (name = "Trust", description = "Device trust grants"),
        (name = "Tokens", description = "Token issuance, rotation and revocation"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .build(),
                ),
            );
            components.add_security_scheme(
                "mobile_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("x-api-key"))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AuthConfig,
    pub db: Database,
    pub devices: DeviceService,
    pub tokens: TokenService,
    pub trust: TrustService,
    pub verifier: SignatureVerifier,
    pub events: SecurityEventService,
    pub nonces: std::sync::Arc<dyn services::NonceCache>,
    pub register_rate_limiter: service_core::middleware::rate_limit::IpRateLimiter,
    pub ip_rate_limiter: service_core::middleware::rate_limit::IpRateLimiter,
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    // Registration route with its own tight rate limit plus the API key gate
    let register_limiter = state.register_rate_limiter.clone();
    let register_route = Router::new()
        .route("/devices/register", post(handlers::devices::register))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::api_key_middleware,
        ))
        .layer(from_fn_with_state(
            register_limiter,
            ip_rate_limit_middleware,
        ));

    // Bearer-guarded token routes
    let bearer_routes = Router::new()
        .route("/tokens/info", get(handlers::tokens::info))
        .route("/tokens/device", delete(handlers::tokens::revoke_device))
        .route("/tokens/all", delete(handlers::tokens::revoke_all))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let ip_limiter = state.ip_rate_limiter.clone();

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics));

    let swagger_enabled = match state.config.environment {
        config::Environment::Dev => true,
        config::Environment::Prod => state.config.swagger.enabled == config::SwaggerMode::Public,
    };

    if swagger_enabled {
        app =
            app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        // Keep the OpenAPI JSON available for programmatic access
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { service_core::axum::Json(ApiDoc::openapi()) }),
        );
    }

    let app = app
        .merge(register_route)
        .route("/devices", get(handlers::devices::list_devices))
        .route(
            "/devices/:device_id",
            delete(handlers::devices::remove_device),
        )
        .route(
            "/devices/:device_id/trust",
            post(handlers::devices::trust_device).delete(handlers::devices::untrust_device),
        )
        .route("/tokens/generate", post(handlers::tokens::generate))
        .route("/tokens/refresh", post(handlers::tokens::refresh))
        .route("/tokens/long-term", post(handlers::tokens::long_term))
        .route("/tokens/validate", get(handlers::tokens::validate))
        .route(
            "/tokens/should-rotate",
            get(handlers::tokens::should_rotate),
        )
        .merge(bearer_routes)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        // Request signature validation
        .layer(from_fn_with_state(
            state.clone(),
            middleware::signature_validation_middleware,
        ))
        // Add metrics middleware
        .layer(from_fn(middleware::metrics_middleware))
        // Add tracing layer
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        // Add tracing middleware for request_id
        .layer(from_fn(request_id_middleware))
        // Add security headers middleware
        .layer(from_fn(security_headers_middleware))
        // Add CORS layer
        .layer(
            CorsLayer::new()
                .allow_origin(
                    state
                        .config
                        .security
                        .allowed_origins
                        .iter()
                        .map(|o| {
                            o.parse::<service_core::axum::http::HeaderValue>()
                                .unwrap_or_else(|e| {
                                    tracing::error!(
                                        "Invalid CORS origin '{}': {}. Using fallback.",
                                        o,
                                        e
                                    );
                                    service_core::axum::http::HeaderValue::from_static("*")
                                })
                        })
                        .collect::<Vec<service_core::axum::http::HeaderValue>>(),
                )
                .allow_methods([
                    service_core::axum::http::Method::GET,
                    service_core::axum::http::Method::POST,
                    service_core::axum::http::Method::DELETE,
                    service_core::axum::http::Method::OPTIONS,
                ])
                .allow_headers([
                    service_core::axum::http::header::AUTHORIZATION,
                    service_core::axum::http::header::CONTENT_TYPE,
                    service_core::axum::http::header::HeaderName::from_static("x-api-key"),
                    service_core::axum::http::header::HeaderName::from_static("x-device-id"),
                    service_core::axum::http::header::HeaderName::from_static("x-timestamp"),
                    service_core::axum::http::header::HeaderName::from_static("x-nonce"),
                    service_core::axum::http::header::HeaderName::from_static("x-signature"),
                ]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    service_core::axum::extract::State(state): service_core::axum::extract::State<AppState>,
) -> Result<service_core::axum::Json<serde_json::Value>, AppError> {
    state.db.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Database health check failed");
        AppError::ServiceUnavailable
    })?;

    state.nonces.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Redis health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(service_core::axum::Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
    })))
}
