//! WebSocket Handler
//!
//! `/api/chat?personality_id=` upgrades to a binary full-duplex session.
//! Socket halves are adapted to the pipeline's [`FrameSource`] and
//! [`FrameSink`] and handed to a [`Session`].

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use async_trait::async_trait;
use voice_gateway_core::{PersonalityConfig, ServerFrame};
use voice_gateway_pipeline::{FrameSink, FrameSource, InboundMessage, Session, TransportError};

use crate::state::AppState;
use crate::MODELS_LOADING_REASON;

pub const MISSING_PERSONALITY_REASON: &str = "personality_id is required";
pub const UNKNOWN_PERSONALITY_REASON: &str = "Personality not found";

#[derive(Debug, Deserialize)]
pub struct ChatParams {
    pub personality_id: Option<String>,
}

/// Inbound half of a chat socket
pub struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_message(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        let message = self.0.next().await?;
        Some(match message {
            Ok(Message::Binary(bytes)) => Ok(InboundMessage::Binary(bytes)),
            Ok(Message::Text(text)) => Ok(InboundMessage::Text(text)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(InboundMessage::Ping),
            Ok(Message::Close(_)) => Ok(InboundMessage::Close),
            Err(e) => Err(TransportError::Io(e.to_string())),
        })
    }
}

/// Outbound half of a chat socket
pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

impl WsSink {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            closed: false,
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: ServerFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.sink
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, reason: Option<String>) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = reason.map(|reason| CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        });
        // The peer may already be gone; a failed close frame is not an error
        if let Err(e) = self.sink.send(Message::Close(frame)).await {
            tracing::debug!(error = %e, "Close frame not delivered");
        }
        let _ = self.sink.close().await;
        Ok(())
    }
}

/// Upgrade handler for `/api/chat`
pub async fn chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ChatParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.personality_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, personality_id: Option<String>) {
    let (sender, receiver) = socket.split();
    let source = WsSource(receiver);
    let mut sink = WsSink::new(sender);

    let slot = match state.gate.slot() {
        Ok(slot) => slot,
        Err(_) => {
            tracing::debug!("Rejected chat connection, engine not ready");
            let _ = sink.close(Some(MODELS_LOADING_REASON.to_string())).await;
            return;
        }
    };

    let personality_id = match personality_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id,
        None => {
            let _ = sink.close(Some(MISSING_PERSONALITY_REASON.to_string())).await;
            return;
        }
    };

    let personality = match resolve_personality(&state, &personality_id).await {
        Some(personality) => personality,
        None => {
            tracing::info!(personality = %personality_id, "Chat requested for unknown personality");
            let _ = sink.close(Some(UNKNOWN_PERSONALITY_REASON.to_string())).await;
            return;
        }
    };

    let session = Session::new(Uuid::new_v4().to_string(), personality);
    let _registration = state.sessions.register(&session, &personality_id);
    let options = state.session_options();

    let report = session
        .run(slot, Arc::clone(&state.codec), source, sink, &options)
        .await;

    tracing::info!(
        session_id = %report.session_id,
        personality = %personality_id,
        success = report.outcome.is_success(),
        frames = report.stats.frames,
        protocol_errors = report.protocol_errors,
        duration_ms = report.duration.as_millis() as u64,
        "Chat connection finished"
    );
}

async fn resolve_personality(state: &AppState, id: &str) -> Option<PersonalityConfig> {
    match state.personalities.resolve(id).await {
        Ok(personality) => personality,
        Err(e) if e.is_client_error() => None,
        Err(e) => {
            tracing::error!(personality = %id, error = %e, "Failed to load personality");
            None
        }
    }
}
