//! Voice embedding endpoints
//!
//! Listing embedding files, generating an embedding from reference audio and
//! rendering a short preview in a stored voice. Generation and preview run
//! under the engine lease, so they queue behind live chat sessions.

use axum::{
    extract::{Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::time::Instant;

use voice_gateway_pipeline::{decode_wav, encode_wav, resample};

use crate::state::AppState;
use crate::ServerError;

/// `GET /api/voices`
pub async fn list_voices(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let voices = state.embeddings.list().await?;
    Ok(Json(serde_json::json!({
        "count": voices.len(),
        "voices": voices,
    })))
}

/// `POST /api/generate-embedding` (multipart `audio` + `name`)
pub async fn generate_embedding(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ServerError> {
    let slot = state.gate.slot().map_err(|_| ServerError::not_ready())?;

    let mut audio: Option<Vec<u8>> = None;
    let mut name: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::InvalidRequest(e.to_string()))?
    {
        match field.name() {
            Some("audio") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
                audio = Some(bytes.to_vec());
            }
            Some("name") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
                name = Some(text.trim().to_string());
            }
            _ => {}
        }
    }

    let audio = audio.filter(|a| !a.is_empty());
    let name = name.filter(|n| !n.is_empty());
    let (Some(audio), Some(name)) = (audio, name) else {
        return Err(ServerError::InvalidRequest(
            "missing audio file or embedding name".to_string(),
        ));
    };

    state.embeddings.checked_file_name(&name)?;

    let (pcm, source_rate) =
        decode_wav(&audio).map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
    let target_rate = slot.info().sample_rate;
    let pcm = resample(&pcm, source_rate, target_rate);

    let (prompt, silence_seconds) = {
        let config = state.get_config();
        (
            config.priming.default_prompt.clone(),
            config.priming.silence_seconds,
        )
    };

    let started = Instant::now();
    let lease = slot.acquire("generate-embedding").await;
    let (lease, result) = lease
        .run_blocking(move |runtime| runtime.generate_embedding(&pcm, &prompt, silence_seconds))
        .await?;
    drop(lease);
    let embedding = result?;

    let file = state.embeddings.write(&name, &embedding).await?;
    tracing::info!(
        name = %name,
        file = %file,
        source_rate,
        target_rate,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Generated embedding"
    );

    Ok(Json(serde_json::json!({
        "status": "ok",
        "embedding": file,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// `POST /api/test-embedding`; responds with `audio/wav`
pub async fn test_embedding(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Response, ServerError> {
    let slot = state.gate.slot().map_err(|_| ServerError::not_ready())?;

    let name = request.name.trim();
    if name.is_empty() {
        return Err(ServerError::InvalidRequest("missing embedding name".to_string()));
    }

    let file = state.embeddings.checked_file_name(name)?;
    let embedding = state
        .embeddings
        .read(&file)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("embedding '{}' not found", file)))?;

    let (prompt, seconds, silence_seconds) = {
        let config = state.get_config();
        let prompt = request
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| config.priming.default_prompt.clone());
        (prompt, config.preview.seconds, config.priming.silence_seconds)
    };

    let sample_rate = slot.info().sample_rate;
    let lease = slot.acquire("test-embedding").await;
    let (lease, result) = lease
        .run_blocking(move |runtime| {
            runtime.render_preview(&embedding, &prompt, seconds, silence_seconds)
        })
        .await?;
    drop(lease);
    let pcm = result?;

    let wav = encode_wav(&pcm, sample_rate)?;
    tracing::info!(file = %file, samples = pcm.len(), "Rendered embedding preview");

    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "audio/wav")], wav).into_response())
}
