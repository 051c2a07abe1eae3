//! Traits for the pluggable backends
//!
//! The gateway drives three external collaborators it does not implement:
//!
//! ```text
//!   InferenceEngine: PCM frame → codes → tokens → PCM (stateful, single-owner)
//!   FrameCodec:      compressed client audio ↔ PCM (one decoder/encoder pair per session)
//!   TextTokenizer:   prompt text → token ids, token id → text piece
//! ```
//!
//! Reference implementations live in the pipeline crate; real model
//! backends plug in behind the same traits.

mod codec;
mod engine;
mod tokenizer;

pub use codec::{FrameCodec, StreamDecoder, StreamEncoder};
pub use engine::{
    CodeFrame, InferenceEngine, PrimingStep, SamplingConfig, TokenFrame, AUDIO_CHANNELS,
};
pub use tokenizer::{TextTokenizer, WORD_MARKER};
