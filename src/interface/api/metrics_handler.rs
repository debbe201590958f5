//! Prometheus metrics handler

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Describe metrics
    describe_gauge!("sip_active_calls", "Number of currently active SIP calls");
    describe_counter!(
        "sip_registrations_total",
        "Total number of REGISTER outcomes, labelled by success"
    );
    describe_counter!("sip_calls_total", "Total number of SIP calls placed or received");
    describe_counter!(
        "sip_calls_failed",
        "Total number of SIP calls that ended in failure"
    );

    Ok(handle)
}

/// HTTP metrics handler
pub async fn metrics_handler(
    axum::extract::State(prometheus_handle): axum::extract::State<PrometheusHandle>,
) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}
