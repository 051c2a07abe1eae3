//! Voice Gateway Server
//!
//! Serves the full-duplex voice chat WebSocket (`/api/chat`) and the REST
//! surface around it: engine loading and status, model-path settings,
//! personalities, voice embeddings, active sessions, health and metrics.

pub mod http;
pub mod metrics;
pub mod session;
pub mod state;
pub mod voices;
pub mod websocket;

pub use http::create_router;
pub use metrics::{init_metrics, metrics_handler};
pub use session::{SessionRegistry, SessionSummary};
pub use state::AppState;
pub use websocket::{WsSink, WsSource};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use voice_gateway_persistence::PersistenceError;
use voice_gateway_pipeline::PipelineError;

/// Close reason sent when a client connects before the engine is ready
pub const MODELS_LOADING_REASON: &str = "Models are still loading";

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotReady(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn not_ready() -> Self {
        ServerError::NotReady(MODELS_LOADING_REASON.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Engine(_) | ServerError::Persistence(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ServerError> for StatusCode {
    fn from(err: ServerError) -> Self {
        err.status()
    }
}

impl From<PersistenceError> for ServerError {
    fn from(err: PersistenceError) -> Self {
        if err.is_client_error() {
            ServerError::InvalidRequest(err.to_string())
        } else {
            ServerError::Persistence(err.to_string())
        }
    }
}

impl From<PipelineError> for ServerError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotReady(_) => ServerError::not_ready(),
            PipelineError::Embedding(_) => ServerError::InvalidRequest(err.to_string()),
            other => ServerError::Engine(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
