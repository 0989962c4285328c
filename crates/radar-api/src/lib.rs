//! PhishRadar read API
//!
//! Thin HTTP surface over the engine: dashboard rollups, campaign
//! listings with evidence, and the orchestration trigger. All state lives
//! in the engine's store; handlers never mutate telemetry.

pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use radar_core::orchestrate::Orchestrator;
use radar_core::pipeline::IngestPipeline;
use radar_core::store::EventStore;
use radar_core::{RadarConfig, RadarError};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub pipeline: Arc<IngestPipeline>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: RadarConfig,
}

/// Standard API envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Handler-level failures mapped to HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<RadarError> for ApiError {
    fn from(e: RadarError) -> Self {
        match e {
            RadarError::Persistence(msg) => Self::Unavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable", m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        let body: ApiResponse<()> = ApiResponse {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message,
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP router over shared engine state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/dashboard", get(routes::dashboard))
        .route("/api/campaigns", get(routes::list_campaigns))
        .route("/api/campaigns/:id", get(routes::get_campaign))
        .route(
            "/api/campaigns/:id/orchestrator-payloads",
            get(routes::orchestrator_payloads),
        )
        .route("/api/campaigns/:id/orchestrate", post(routes::orchestrate))
        .route(
            "/api/campaigns/:id/evidence/dmarc",
            get(routes::dmarc_evidence),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}
