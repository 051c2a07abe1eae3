//! Prometheus metrics
//!
//! The pipeline records through the `metrics` facade; this module installs
//! the Prometheus recorder and serves its text rendering.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::state::AppState;

/// Buckets for per-frame processing time (seconds)
const FRAME_BUCKETS: &[f64] = &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.08, 0.1, 0.25];

/// Buckets for priming, lock waits and model loads (seconds)
const LONG_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Install the global Prometheus recorder.
///
/// Fails if a recorder is already installed in this process.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_frame_processing_seconds".to_string()),
            FRAME_BUCKETS,
        )?
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LONG_BUCKETS)?
        .install_recorder()?;

    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!("gateway_sessions_started_total", "Chat sessions accepted");
    metrics::describe_counter!(
        "gateway_sessions_completed_total",
        "Chat sessions that reached the live phase and ended normally"
    );
    metrics::describe_counter!(
        "gateway_sessions_aborted_total",
        "Chat sessions whose client left during priming"
    );
    metrics::describe_counter!(
        "gateway_sessions_rejected_total",
        "Chat sessions refused before priming"
    );
    metrics::describe_counter!("gateway_sessions_failed_total", "Chat sessions ended by an engine error");
    metrics::describe_counter!(
        "gateway_priming_aborted_total",
        "Priming runs stopped by a failed liveness probe"
    );
    metrics::describe_counter!("gateway_engine_load_requests_total", "Model load requests accepted");
    metrics::describe_counter!(
        "gateway_protocol_errors_total",
        "Inbound messages skipped as protocol noise"
    );
    metrics::describe_counter!(
        "gateway_frames_processed_total",
        "Audio frames run through the engine"
    );
    metrics::describe_counter!("gateway_text_tokens_total", "Text tokens sent to clients");
    metrics::describe_counter!("gateway_audio_chunks_total", "Audio chunks sent to clients");
    metrics::describe_counter!("gateway_engine_loads_total", "Completed model load attempts");
    metrics::describe_histogram!(
        "gateway_frame_processing_seconds",
        "Engine time per audio frame"
    );
    metrics::describe_histogram!(
        "gateway_priming_duration_seconds",
        "System prompt priming time"
    );
    metrics::describe_histogram!(
        "gateway_engine_lock_wait_seconds",
        "Time spent waiting for the engine"
    );
    metrics::describe_gauge!("gateway_sessions_waiting", "Sessions queued for the engine");
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
