//! Softphone control API handlers

use crate::application::bridge::{http_status, ControlBridge, Intent, Reply, StatusSnapshot};
use crate::domain::shared::error::DomainError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Shared state of the control routes
#[derive(Clone)]
pub struct ApiState {
    pub bridge: ControlBridge,
}

impl ApiState {
    pub fn new(bridge: ControlBridge) -> Self {
        Self { bridge }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MakeCallRequest {
    pub destination: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DtmfRequest {
    pub digits: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnswerRequest {
    pub status_code: Option<u16>,
}

/// Failed intent, rendered as `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(http_status(&self.0)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            DomainError::ValidationError(message) => message.clone(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            warn!("API: {}", message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// POST /call
pub async fn make_call(
    State(state): State<ApiState>,
    body: Option<Json<MakeCallRequest>>,
) -> Result<Json<Reply>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    info!("API: Make call to {:?}", request.destination);

    let reply = state
        .bridge
        .submit(Intent::MakeCall {
            destination: request.destination.unwrap_or_default(),
        })
        .await?;
    Ok(Json(reply))
}

/// POST /hangup
pub async fn hangup(State(state): State<ApiState>) -> Result<Json<Reply>, ApiError> {
    info!("API: Hangup");
    Ok(Json(state.bridge.submit(Intent::Hangup).await?))
}

/// POST /dtmf
pub async fn send_dtmf(
    State(state): State<ApiState>,
    body: Option<Json<DtmfRequest>>,
) -> Result<Json<Reply>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    let reply = state
        .bridge
        .submit(Intent::SendDtmf {
            digits: request.digits.unwrap_or_default(),
        })
        .await?;
    Ok(Json(reply))
}

/// POST /answer
pub async fn answer(
    State(state): State<ApiState>,
    body: Option<Json<AnswerRequest>>,
) -> Result<Json<Reply>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    info!("API: Answer with {:?}", request.status_code);

    let reply = state
        .bridge
        .submit(Intent::Answer {
            status_code: request.status_code,
        })
        .await?;
    Ok(Json(reply))
}

/// POST /register
pub async fn register(State(state): State<ApiState>) -> Result<Json<Reply>, ApiError> {
    info!("API: Register");
    Ok(Json(state.bridge.submit(Intent::Register).await?))
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    Json(state.bridge.status())
}

/// GET /health
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<serde_json::Value>) {
    if state.bridge.is_healthy() {
        (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "sip_registered": true })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "sip_registered": false })),
        )
    }
}
