//! HTTP Endpoints
//!
//! REST API around the chat WebSocket: engine loading, model-path settings,
//! personalities, voices, sessions, health and metrics.

use axum::{
    extract::{Json, Path, State},
    http::{HeaderValue, Method, StatusCode},
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use voice_gateway_core::{PersonalityConfig, WeightPaths};
use voice_gateway_pipeline::{LoadAccepted, LoadRejected};

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::voices::{generate_embedding, list_voices, test_embedding};
use crate::websocket::chat_handler;
use crate::ServerError;

const FALLBACK_ORIGIN: &str = "http://localhost:3000";

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let config = state.get_config();
    let cors_layer = build_cors_layer(&config.server.cors_origins, config.server.cors_enabled);
    let timeout = Duration::from_secs(config.server.request_timeout_seconds);
    drop(config);

    Router::new()
        // Chat WebSocket
        .route("/api/chat", get(chat_handler))
        // Engine lifecycle
        .route("/api/status", get(engine_status))
        .route("/api/load-models", post(load_models))
        .route("/api/settings", get(get_settings).post(save_settings))
        // Personalities
        .route("/api/personalities", get(list_personalities).post(save_personality))
        .route("/api/personalities/:id", delete(delete_personality))
        // Voices
        .route("/api/voices", get(list_voices))
        .route("/api/generate-embedding", post(generate_embedding))
        .route("/api/test-embedding", post(test_embedding))
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(cancel_session))
        // Health check
        .route("/health", get(health_check))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        // Admin
        .route("/admin/reload-config", post(reload_config))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins");
        return CorsLayer::permissive();
    }

    if origins.is_empty() {
        tracing::info!("No CORS origins configured, allowing any origin");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any);
    }

    let parsed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed_origins.is_empty() {
        tracing::error!(
            "All configured CORS origins are invalid, falling back to {}",
            FALLBACK_ORIGIN
        );
        return CorsLayer::new()
            .allow_origin(HeaderValue::from_static(FALLBACK_ORIGIN))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any);
    }

    tracing::info!("CORS configured with {} origins", parsed_origins.len());
    CorsLayer::new()
        .allow_origin(parsed_origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

/// `GET /api/status`
async fn engine_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.gate.status();
    let engine = state.gate.slot().ok().map(|slot| slot.info().clone());
    Json(serde_json::json!({
        "ready": status.ready,
        "loading": status.loading,
        "phase": status.phase,
        "status": status.status,
        "engine": engine,
    }))
}

/// `POST /api/load-models`.
///
/// Paths in the body win; when the body names none, the saved settings are
/// used.
async fn load_models(
    State(state): State<AppState>,
    Json(paths): Json<WeightPaths>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut paths = paths.cleaned();
    if paths.missing().len() == 3 {
        paths = state.model_settings.load().await.cleaned();
    }

    match state.gate.request_load(&paths) {
        Ok(LoadAccepted::Started) => {
            tracing::info!(
                lm = %paths.lm_weights_path,
                codec = %paths.codec_weights_path,
                tokenizer = %paths.tokenizer_path,
                "Model load started"
            );
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "loading started" })),
            )
        }
        Ok(LoadAccepted::AlreadyLoaded) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "already loaded", "ready": true })),
        ),
        Err(LoadRejected::AlreadyLoading) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "Models are already loading" })),
        ),
        Err(LoadRejected::MissingPaths(missing)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "All three model paths are required",
                "missing": missing,
            })),
        ),
    }
}

/// `GET /api/settings`
async fn get_settings(State(state): State<AppState>) -> Json<WeightPaths> {
    Json(state.model_settings.load().await)
}

/// `POST /api/settings`
async fn save_settings(
    State(state): State<AppState>,
    Json(paths): Json<WeightPaths>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let saved = state.model_settings.save(&paths).await?;
    tracing::info!(file = %state.model_settings.path().display(), "Saved model settings");
    Ok(Json(serde_json::json!({ "status": "ok", "settings": saved })))
}

/// `GET /api/personalities`; embedding data is stripped
async fn list_personalities(
    State(state): State<AppState>,
) -> Result<Json<Vec<PersonalityConfig>>, ServerError> {
    Ok(Json(state.personalities.list().await?))
}

/// `POST /api/personalities`
async fn save_personality(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let has_id = body
        .get("id")
        .and_then(|id| id.as_str())
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        return Err(ServerError::InvalidRequest("missing id".to_string()));
    }

    let personality: PersonalityConfig = serde_json::from_value(body)
        .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
    let id = personality.id.clone();
    state.personalities.save(personality).await?;

    Ok(Json(serde_json::json!({ "status": "ok", "id": id })))
}

/// `DELETE /api/personalities/:id`
async fn delete_personality(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if state.personalities.delete(&id).await? {
        Ok(Json(serde_json::json!({ "status": "ok" })))
    } else {
        Err(ServerError::NotFound("not found".to_string()))
    }
}

/// `GET /api/sessions`
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.sessions.list();
    let engine = state.gate.slot().ok().map(|slot| {
        serde_json::json!({
            "holder": slot.holder(),
            "waiting": slot.waiting(),
        })
    });

    Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
        "engine": engine,
    }))
}

/// `DELETE /api/sessions/:id`
async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if state.sessions.cancel(&id) {
        tracing::info!(session_id = %id, "Session cancelled by request");
        Ok(Json(serde_json::json!({ "status": "ok" })))
    } else {
        Err(ServerError::NotFound(format!("session '{}' not found", id)))
    }
}

/// `GET /health`
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.gate.status();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": status.phase,
        "sessions": state.sessions.count(),
    }))
}

/// `POST /admin/reload-config`
async fn reload_config(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.reload_config() {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!(error = %e, "Config reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e })),
            )
        }
    }
}
