//! Session concurrency engine
//!
//! One [`Session`] per client connection. A session moves through
//!
//! ```text
//! Queued ─lease─▶ Priming ─handshake─▶ Live ─first task done─▶ Closing ─▶ Closed
//!    │               │
//!    └──cancel───────┴──client gone / rejected──────────────▶ Closing
//! ```
//!
//! While live, three tasks share one cancellation token:
//!
//! - receive: reads client messages, decodes audio, forwards PCM
//! - process: owns the frame pipeline (and with it the engine lease)
//! - send: writes outbound frames in order
//!
//! The first task to finish cancels the other two, all three are awaited, the
//! connection is closed and only then is the engine lease released.

use crate::frame_pipeline::{AudioFramePipeline, PipelineStats, SentinelSet};
use crate::priming::{run_priming, LivenessProbe, PrimingOutcome};
use crate::runtime::{EngineLease, EngineSlot};
use crate::transport::{FrameSink, FrameSource, InboundMessage, SourceProbe, TransportError};
use crate::PipelineError;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use voice_gateway_core::{ClientFrame, FrameCodec, PersonalityConfig, ServerFrame, StreamDecoder};

/// Close reason sent when a personality's voice embedding cannot be loaded
pub const INVALID_EMBEDDING_REASON: &str = "Invalid voice embedding";

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a liveness probe waits for inbound traffic
    pub liveness_timeout: Duration,
    /// Capacity of the PCM and outbound frame channels
    pub channel_capacity: usize,
    pub sentinels: SentinelSet,
    /// Silence fed around the system prompt while priming
    pub silence_seconds: f32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_millis(10),
            channel_capacity: 64,
            sentinels: SentinelSet::default(),
            silence_seconds: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Waiting for the engine lease
    Queued,
    Priming,
    Live,
    Closing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Queued => "queued",
            SessionPhase::Priming => "priming",
            SessionPhase::Live => "live",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
        }
    }
}

/// The three live tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTask {
    Receive,
    Process,
    Send,
}

impl fmt::Display for SessionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionTask::Receive => write!(f, "receive"),
            SessionTask::Process => write!(f, "process"),
            SessionTask::Send => write!(f, "send"),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Live session ended normally; `trigger` finished first
    Completed { trigger: SessionTask },
    /// Client left before priming finished
    PrimingAborted,
    /// Session refused before going live (close reason attached)
    Rejected(String),
    /// Cancelled from outside, e.g. server shutdown
    Cancelled,
    Failed(String),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub stats: PipelineStats,
    pub protocol_errors: u64,
    pub duration: Duration,
}

/// A single client conversation
pub struct Session {
    id: String,
    personality: PersonalityConfig,
    phase_tx: watch::Sender<SessionPhase>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(id: impl Into<String>, personality: PersonalityConfig) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Queued);
        Self {
            id: id.into(),
            personality,
            phase_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    /// Token that ends the session from outside
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase_tx.send_replace(phase);
        tracing::debug!(session_id = %self.id, phase = phase.as_str(), "Session phase");
    }

    /// Drive the session to completion.
    ///
    /// Never returns before the engine lease (if it was acquired) has been
    /// released.
    pub async fn run<S, K>(
        self,
        slot: Arc<EngineSlot>,
        codec: Arc<dyn FrameCodec>,
        source: S,
        sink: K,
        options: &SessionOptions,
    ) -> SessionReport
    where
        S: FrameSource,
        K: FrameSink,
    {
        let started = Instant::now();
        metrics::counter!("gateway_sessions_started_total").increment(1);
        tracing::info!(
            session_id = %self.id,
            personality = %self.personality.id,
            queued_ahead = slot.waiting() + usize::from(slot.holder().is_some()),
            "Session started"
        );

        let (outcome, stats, protocol_errors) =
            self.drive(slot, codec, source, sink, options).await;
        self.set_phase(SessionPhase::Closed);

        let duration = started.elapsed();
        let counter = match &outcome {
            SessionOutcome::Completed { .. } => "gateway_sessions_completed_total",
            SessionOutcome::PrimingAborted | SessionOutcome::Cancelled => {
                "gateway_sessions_aborted_total"
            }
            SessionOutcome::Rejected(_) => "gateway_sessions_rejected_total",
            SessionOutcome::Failed(_) => "gateway_sessions_failed_total",
        };
        metrics::counter!(counter).increment(1);
        metrics::counter!("gateway_frames_processed_total").increment(stats.frames);
        metrics::counter!("gateway_text_tokens_total").increment(stats.text_tokens);
        metrics::counter!("gateway_audio_chunks_total").increment(stats.audio_chunks);

        tracing::info!(
            session_id = %self.id,
            outcome = ?outcome,
            frames = stats.frames,
            text_tokens = stats.text_tokens,
            protocol_errors,
            duration_ms = duration.as_millis() as u64,
            "Session closed"
        );

        SessionReport {
            session_id: self.id,
            outcome,
            stats,
            protocol_errors,
            duration,
        }
    }

    async fn drive<S, K>(
        &self,
        slot: Arc<EngineSlot>,
        codec: Arc<dyn FrameCodec>,
        mut source: S,
        mut sink: K,
        options: &SessionOptions,
    ) -> (SessionOutcome, PipelineStats, u64)
    where
        S: FrameSource,
        K: FrameSink,
    {
        let none = PipelineStats::default();

        // Queued
        let lease = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.close(&mut sink, None).await;
                return (SessionOutcome::Cancelled, none, 0);
            }
            lease = slot.acquire(&self.id) => lease,
        };

        // Priming
        self.set_phase(SessionPhase::Priming);
        let personality = self.personality.clone();
        let silence_seconds = options.silence_seconds;
        let (lease, prepared) = match lease
            .run_blocking(move |runtime| runtime.prepare_session(&personality, silence_seconds))
            .await
        {
            Ok(result) => result,
            Err(e) => return (self.fail(&mut sink, None, e).await, none, 0),
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(PipelineError::Embedding(msg)) => {
                tracing::warn!(
                    session_id = %self.id,
                    personality = %self.personality.id,
                    error = %msg,
                    "Rejecting session with invalid voice embedding"
                );
                self.close_then_release(&mut sink, lease, Some(INVALID_EMBEDDING_REASON))
                    .await;
                return (
                    SessionOutcome::Rejected(INVALID_EMBEDDING_REASON.to_string()),
                    none,
                    0,
                );
            }
            Err(e) => return (self.fail(&mut sink, Some(lease), e).await, none, 0),
        };
        tracing::debug!(
            session_id = %self.id,
            steps = prepared.plan.len(),
            prompt_tokens = prepared.prompt_tokens,
            embedding = ?prepared.embedding,
            "Priming"
        );

        let mut decoder = codec.decoder();
        let encoder = codec.encoder();
        decoder.reset();

        let mut probe = SourceProbe::new(&mut source, options.liveness_timeout)
            .with_cancel(self.cancel.clone());
        let (lease, outcome) = match run_priming(lease, &prepared.plan, &mut probe).await {
            Ok(result) => result,
            Err(e) => return (self.fail(&mut sink, None, e).await, none, 0),
        };
        let still_there = match outcome {
            PrimingOutcome::Completed { .. } => probe.is_alive().await,
            PrimingOutcome::Aborted { .. } => false,
        };
        drop(probe);

        if !still_there {
            // An aborted run was already reset; a completed one still holds its context
            let lease = match outcome {
                PrimingOutcome::Completed { .. } => match reset_engine(lease).await {
                    Ok(lease) => lease,
                    Err(e) => return (self.fail(&mut sink, None, e).await, none, 0),
                },
                PrimingOutcome::Aborted { .. } => lease,
            };
            self.close_then_release(&mut sink, lease, None).await;
            let outcome = if self.cancel.is_cancelled() {
                SessionOutcome::Cancelled
            } else {
                SessionOutcome::PrimingAborted
            };
            return (outcome, none, 0);
        }

        if let Err(e) = sink.send_frame(ServerFrame::Handshake).await {
            tracing::info!(session_id = %self.id, error = %e, "Client left before handshake");
            let lease = match reset_engine(lease).await {
                Ok(lease) => lease,
                Err(e) => return (self.fail(&mut sink, None, e).await, none, 0),
            };
            self.close_then_release(&mut sink, lease, None).await;
            return (SessionOutcome::PrimingAborted, none, 0);
        }

        // Live
        self.set_phase(SessionPhase::Live);
        let pipeline = AudioFramePipeline::new(lease, encoder, options.sentinels.clone());
        self.run_live(source, sink, decoder, pipeline, options).await
    }

    async fn run_live<S, K>(
        &self,
        source: S,
        sink: K,
        decoder: Box<dyn StreamDecoder>,
        pipeline: AudioFramePipeline,
        options: &SessionOptions,
    ) -> (SessionOutcome, PipelineStats, u64)
    where
        S: FrameSource,
        K: FrameSink,
    {
        let tasks = self.cancel.child_token();
        let protocol_errors = Arc::new(AtomicU64::new(0));
        let capacity = options.channel_capacity.max(1);
        let (pcm_tx, pcm_rx) = mpsc::channel::<Vec<f32>>(capacity);
        let (frame_tx, frame_rx) = mpsc::channel::<ServerFrame>(capacity);

        let mut receive = tokio::spawn(receive_loop(
            source,
            decoder,
            pcm_tx,
            tasks.clone(),
            Arc::clone(&protocol_errors),
            self.id.clone(),
        ));
        let mut process = tokio::spawn(process_loop(pipeline, pcm_rx, frame_tx, tasks.clone()));
        let mut send = tokio::spawn(send_loop(sink, frame_rx, tasks.clone()));

        let mut received = None;
        let mut processed = None;
        let mut sent = None;
        let trigger = tokio::select! {
            result = &mut receive => { received = Some(result); SessionTask::Receive }
            result = &mut process => { processed = Some(result); SessionTask::Process }
            result = &mut send => { sent = Some(result); SessionTask::Send }
        };
        tasks.cancel();
        tracing::debug!(session_id = %self.id, trigger = %trigger, "Live task finished, stopping the rest");

        let received = match received {
            Some(result) => result,
            None => receive.await,
        };
        let processed = match processed {
            Some(result) => result,
            None => process.await,
        };
        let sent = match sent {
            Some(result) => result,
            None => send.await,
        };

        // Closing
        self.set_phase(SessionPhase::Closing);
        let mut failure = None;
        let mut record = |task: SessionTask, error: String| {
            tracing::error!(session_id = %self.id, task = %task, error = %error, "Session task failed");
            failure.get_or_insert(error);
        };

        match received {
            Ok(Ok(())) => {}
            Ok(Err(e)) => record(SessionTask::Receive, e.to_string()),
            Err(e) => record(SessionTask::Receive, join_failure(e)),
        }
        let pipeline = match processed {
            Ok((pipeline, Ok(()))) => pipeline,
            Ok((pipeline, Err(e))) => {
                record(SessionTask::Process, e.to_string());
                pipeline
            }
            Err(e) => {
                record(SessionTask::Process, join_failure(e));
                None
            }
        };
        let sink = match sent {
            Ok((sink, Ok(()))) => Some(sink),
            Ok((sink, Err(e))) => {
                record(SessionTask::Send, e.to_string());
                Some(sink)
            }
            Err(e) => {
                record(SessionTask::Send, join_failure(e));
                None
            }
        };

        if let Some(mut sink) = sink {
            self.close(&mut sink, None).await;
        }
        let stats = pipeline.as_ref().map(AudioFramePipeline::stats).unwrap_or_default();
        drop(pipeline);

        let outcome = match failure {
            Some(error) => SessionOutcome::Failed(error),
            None if self.cancel.is_cancelled() => SessionOutcome::Cancelled,
            None => SessionOutcome::Completed { trigger },
        };
        (outcome, stats, protocol_errors.load(Ordering::Relaxed))
    }

    async fn close<K: FrameSink>(&self, sink: &mut K, reason: Option<&str>) {
        self.set_phase(SessionPhase::Closing);
        if let Err(e) = sink.close(reason.map(str::to_string)).await {
            tracing::debug!(session_id = %self.id, error = %e, "Close after disconnect");
        }
    }

    async fn close_then_release<K: FrameSink>(
        &self,
        sink: &mut K,
        lease: EngineLease,
        reason: Option<&str>,
    ) {
        self.close(sink, reason).await;
        drop(lease);
    }

    async fn fail<K: FrameSink>(
        &self,
        sink: &mut K,
        lease: Option<EngineLease>,
        error: PipelineError,
    ) -> SessionOutcome {
        tracing::error!(session_id = %self.id, error = %error, "Session failed before going live");
        self.close(sink, None).await;
        drop(lease);
        SessionOutcome::Failed(error.to_string())
    }
}

async fn reset_engine(lease: EngineLease) -> Result<EngineLease, PipelineError> {
    let (lease, ()) = lease.run_blocking(|runtime| runtime.engine.reset()).await?;
    Ok(lease)
}

fn join_failure(err: JoinError) -> String {
    PipelineError::from(err).to_string()
}

async fn receive_loop<S: FrameSource>(
    mut source: S,
    mut decoder: Box<dyn StreamDecoder>,
    pcm_tx: mpsc::Sender<Vec<f32>>,
    cancel: CancellationToken,
    protocol_errors: Arc<AtomicU64>,
    session_id: String,
) -> Result<(), PipelineError> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = source.next_message() => message,
        };

        let bytes = match message {
            None | Some(Ok(InboundMessage::Close)) => {
                tracing::debug!(session_id = %session_id, "Client closed the connection");
                return Ok(());
            }
            Some(Err(TransportError::Closed)) => return Ok(()),
            Some(Err(e)) => {
                tracing::info!(session_id = %session_id, error = %e, "Connection dropped");
                return Ok(());
            }
            Some(Ok(InboundMessage::Ping)) => continue,
            Some(Ok(InboundMessage::Text(_))) => {
                protocol_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_protocol_errors_total").increment(1);
                tracing::warn!(session_id = %session_id, "Ignoring text message from client");
                continue;
            }
            Some(Ok(InboundMessage::Binary(bytes))) => bytes,
        };

        let payload = match ClientFrame::parse(&bytes) {
            Ok(ClientFrame::Audio(payload)) => payload,
            Err(e) => {
                protocol_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_protocol_errors_total").increment(1);
                tracing::warn!(session_id = %session_id, error = %e, "Ignoring malformed message");
                continue;
            }
        };

        if let Err(e) = decoder.append_bytes(&payload) {
            protocol_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_protocol_errors_total").increment(1);
            tracing::warn!(session_id = %session_id, error = %e, "Skipping undecodable audio packet");
            decoder.reset();
            continue;
        }
        let pcm = decoder.read_pcm();
        if pcm.is_empty() {
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = pcm_tx.send(pcm) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn process_loop(
    mut pipeline: AudioFramePipeline,
    mut pcm_rx: mpsc::Receiver<Vec<f32>>,
    frame_tx: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
) -> (Option<AudioFramePipeline>, Result<(), PipelineError>) {
    loop {
        let pcm = tokio::select! {
            _ = cancel.cancelled() => return (Some(pipeline), Ok(())),
            pcm = pcm_rx.recv() => match pcm {
                Some(pcm) => pcm,
                None => return (Some(pipeline), Ok(())),
            },
        };

        // A frame in progress always runs to completion
        let (next, frames) = match pipeline.push_pcm_blocking(pcm).await {
            Ok(result) => result,
            Err(e) => return (None, Err(e)),
        };
        pipeline = next;
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => return (Some(pipeline), Err(e)),
        };

        for frame in frames {
            tokio::select! {
                _ = cancel.cancelled() => return (Some(pipeline), Ok(())),
                sent = frame_tx.send(frame) => {
                    if sent.is_err() {
                        return (Some(pipeline), Ok(()));
                    }
                }
            }
        }
    }
}

async fn send_loop<K: FrameSink>(
    mut sink: K,
    mut frame_rx: mpsc::Receiver<ServerFrame>,
    cancel: CancellationToken,
) -> (K, Result<(), PipelineError>) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return (sink, Ok(())),
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => return (sink, Ok(())),
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return (sink, Ok(())),
            result = sink.send_frame(frame) => result,
        };
        match result {
            Ok(()) => {}
            Err(TransportError::Closed) => return (sink, Ok(())),
            Err(e) => return (sink, Err(PipelineError::Transport(e.to_string()))),
        }
    }
}
