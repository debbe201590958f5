//! API Router configuration

use super::metrics_handler::metrics_handler;
use super::softphone_handler::{
    answer, hangup, health_check, make_call, register, send_dtmf, status, ApiState,
};
use crate::application::bridge::ControlBridge;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn build_router(bridge: ControlBridge, prometheus_handle: PrometheusHandle) -> Router {
    // Health check route (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    // Call control routes
    let control_routes = Router::new()
        .route("/call", post(make_call))
        .route("/hangup", post(hangup))
        .route("/dtmf", post(send_dtmf))
        .route("/answer", post(answer))
        .route("/register", post(register))
        .route("/status", get(status));

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(health_routes)
        .merge(control_routes)
        .with_state(ApiState::new(bridge))
        .merge(metrics_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
