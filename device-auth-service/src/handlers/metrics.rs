use service_core::axum::response::IntoResponse;

/// Prometheus text exposition of the service registry.
pub async fn metrics() -> impl IntoResponse {
    crate::services::metrics::get_metrics()
}
