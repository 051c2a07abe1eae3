//! Core traits and types for the voice gateway
//!
//! This crate provides foundational types used across all other crates:
//! - The binary wire protocol spoken with clients
//! - Audio frame buffering and PCM conversion
//! - Traits for the pluggable backends (inference engine, frame codec, tokenizer)
//! - Personality configuration and prompt helpers
//! - Model weight paths
//! - Error types

pub mod audio;
pub mod error;
pub mod personality;
pub mod protocol;
pub mod traits;
pub mod weights;

pub use audio::{f32_to_pcm16_le, pcm16_le_to_f32, AudioFrameBuffer};
pub use error::{Error, Result};
pub use personality::{
    embedding_cache_key, wrap_with_system_tags, PersonalityConfig, PromptText, SYSTEM_TAG,
};
pub use protocol::{ClientFrame, MessageKind, ProtocolError, ServerFrame};
pub use traits::{
    CodeFrame, FrameCodec, InferenceEngine, PrimingStep, SamplingConfig, StreamDecoder,
    StreamEncoder, TextTokenizer, TokenFrame, AUDIO_CHANNELS, WORD_MARKER,
};
pub use weights::{clean_path, WeightPaths};
