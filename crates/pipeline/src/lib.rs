//! Session engine and audio pipeline for the voice gateway
//!
//! This crate provides the per-connection machinery between the wire
//! protocol and the inference engine:
//! - Engine lifecycle gate (load once, warm up, report status)
//! - Exclusive engine leases and the single-slot embedding cache
//! - System prompt priming with liveness probing
//! - The audio frame pipeline (PCM frames → engine → audio/text frames)
//! - The session concurrency engine (receive, process and send tasks)
//! - Voice embedding generation and preview rendering
//! - Reference backends (loopback engine, PCM16 codec, HF tokenizer)

pub mod backends;
pub mod embedding_cache;
pub mod frame_pipeline;
pub mod lifecycle;
pub mod priming;
pub mod runtime;
pub mod session;
pub mod transport;
pub mod voice_prompt;

pub use backends::{HfTokenizer, LoopbackConfig, LoopbackEngine, LoopbackLoader, Pcm16Codec};
pub use embedding_cache::{EmbeddingCache, EmbeddingLoad};
pub use frame_pipeline::{AudioFramePipeline, PipelineStats, SentinelSet};
pub use lifecycle::{
    EngineGate, EngineLoader, EnginePhase, GateStatus, LoadAccepted, LoadOptions, LoadRejected,
    LoadedEngine,
};
pub use priming::{run_priming, LivenessProbe, PrimingOutcome, PrimingPlan};
pub use runtime::{EngineInfo, EngineLease, EngineRuntime, EngineSlot, PreparedSession};
pub use session::{
    Session, SessionOptions, SessionOutcome, SessionPhase, SessionReport, SessionTask,
    INVALID_EMBEDDING_REASON,
};
pub use transport::{FrameSink, FrameSource, InboundMessage, SourceProbe, TransportError};
pub use voice_prompt::{decode_wav, encode_wav, resample};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid voice embedding: {0}")]
    Embedding(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Engine not ready: {0}")]
    NotReady(String),

    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<voice_gateway_core::Error> for PipelineError {
    fn from(err: voice_gateway_core::Error) -> Self {
        use voice_gateway_core::Error as CoreError;

        match err {
            CoreError::Codec(msg) => PipelineError::Codec(msg),
            CoreError::Embedding(msg) => PipelineError::Embedding(msg),
            CoreError::Tokenizer(msg) => PipelineError::Tokenizer(msg),
            CoreError::NotReady(msg) => PipelineError::NotReady(msg),
            CoreError::Engine(msg) => PipelineError::Engine(msg),
            other => PipelineError::Engine(other.to_string()),
        }
    }
}

impl From<PipelineError> for voice_gateway_core::Error {
    fn from(err: PipelineError) -> Self {
        use voice_gateway_core::Error as CoreError;

        match err {
            PipelineError::Codec(msg) => CoreError::Codec(msg),
            PipelineError::Embedding(msg) => CoreError::Embedding(msg),
            PipelineError::Tokenizer(msg) => CoreError::Tokenizer(msg),
            PipelineError::NotReady(msg) => CoreError::NotReady(msg),
            PipelineError::Transport(msg) => CoreError::Protocol(msg),
            PipelineError::Engine(msg) => CoreError::Engine(msg),
            other => CoreError::Engine(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::TaskFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_gateway_core::Error as CoreError;

    #[test]
    fn test_engine_error_keeps_single_prefix() {
        let err = PipelineError::from(CoreError::Engine("corrupt packet".into()));
        assert_eq!(err.to_string(), "Engine error: corrupt packet");

        let back = CoreError::from(PipelineError::Engine("oom".into()));
        assert_eq!(back.to_string(), "Engine error: oom");
    }

    #[test]
    fn test_client_errors_keep_their_kind() {
        assert!(matches!(
            PipelineError::from(CoreError::Embedding("short".into())),
            PipelineError::Embedding(_)
        ));
        assert!(matches!(
            PipelineError::from(CoreError::Io(std::io::Error::other("disk"))),
            PipelineError::Engine(_)
        ));
    }
}
