use device_auth_service::{
    build_router,
    config::AuthConfig,
    migrations::apply_v1_device_auth,
    services::{
        Database, DeviceService, RedisNonceCache, SecurityEventService, SignatureSettings,
        SignatureVerifier, TokenService, TokenSettings, TrustService,
    },
    AppState,
};
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::observability::logging::init_tracing;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    // Initialize tracing/logging using shared logic
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    // Initialize metrics
    device_auth_service::services::metrics::init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting device auth service"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| {
            service_core::error::AppError::DatabaseError(anyhow::anyhow!(
                "Failed to connect to PostgreSQL: {}",
                e
            ))
        })?;

    apply_v1_device_auth(&pool).await?;
    let db = Database::new(pool);
    tracing::info!("Database initialized successfully");

    // Initialize Redis-backed nonce cache
    let nonces = Arc::new(
        RedisNonceCache::new(&config.redis.url)
            .await
            .map_err(service_core::error::AppError::InternalError)?,
    );
    tracing::info!("Nonce cache initialized");

    // Initialize rate limiters using shared logic
    let register_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.register_attempts,
        config.rate_limit.register_window_seconds,
    );
    let ip_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.global_ip_limit,
        config.rate_limit.global_ip_window_seconds,
    );
    tracing::info!("Rate limiters initialized: Register and Global IP");

    // Initialize services
    let store = Arc::new(db.clone());
    let events = SecurityEventService::new(store.clone());
    let devices = DeviceService::new(
        store.clone(),
        store.clone(),
        events.clone(),
        config.devices.max_devices_per_user,
    );
    let tokens = TokenService::new(
        store.clone(),
        store.clone(),
        events.clone(),
        TokenSettings {
            access_lifetime_minutes: config.tokens.access_lifetime_minutes,
            refresh_lifetime_hours: config.tokens.refresh_lifetime_hours,
            long_term_lifetime_days: config.tokens.long_term_lifetime_days,
            rotation_threshold: config.tokens.rotation_threshold,
            auto_rotate: config.tokens.auto_rotate,
            min_refresh_interval_seconds: config.tokens.min_refresh_interval_seconds,
        },
    );
    let trust = TrustService::new(
        store.clone(),
        events.clone(),
        config.devices.default_trust_days,
    );
    let verifier = SignatureVerifier::new(
        store.clone(),
        nonces.clone(),
        events.clone(),
        SignatureSettings {
            api_key: config.security.mobile_api_key.clone(),
            require_nonce: config.security.require_nonce,
            timestamp_tolerance_seconds: config.security.timestamp_tolerance_seconds,
            trusted_paths: config.security.trusted_paths.clone(),
            max_failed_attempts: config.security.max_failed_attempts,
            lockout_duration_seconds: config.security.lockout_duration_seconds,
            instrument_success: config.security.instrument_success,
        },
    );

    // Create application state
    let state = AppState {
        config: config.clone(),
        db,
        devices,
        tokens,
        trust,
        verifier,
        events,
        nonces,
        register_rate_limiter,
        ip_rate_limiter,
    };

    // Build application router
    let app = build_router(state).await?;

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
