//! Inference engine trait and the frame types it exchanges

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Number of audio token channels in a [`TokenFrame`] (channels 1..=8)
pub const AUDIO_CHANNELS: usize = 8;

/// Sampling parameters applied to the engine before priming
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub text_temperature: f32,
    pub text_top_k: usize,
    pub audio_temperature: f32,
    pub audio_top_k: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            text_temperature: 0.7,
            text_top_k: 25,
            audio_temperature: 0.8,
            audio_top_k: 250,
        }
    }
}

impl SamplingConfig {
    /// Build a config, clamping both top-k values to at least 1
    pub fn new(
        text_temperature: f32,
        text_top_k: usize,
        audio_temperature: f32,
        audio_top_k: usize,
    ) -> Self {
        Self {
            text_temperature,
            text_top_k: text_top_k.max(1),
            audio_temperature,
            audio_top_k: audio_top_k.max(1),
        }
    }
}

/// Codes produced by encoding one PCM frame.
///
/// Stored column-major: each column holds one value per codebook and is fed
/// to [`InferenceEngine::step`] as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFrame {
    columns: Vec<Vec<u32>>,
}

impl CodeFrame {
    pub fn new(columns: Vec<Vec<u32>>) -> Self {
        Self { columns }
    }

    /// Number of steps (columns) in this frame
    pub fn steps(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &[u32]> {
        self.columns.iter().map(Vec::as_slice)
    }
}

/// Token output of one engine step: channel 0 is text, channels 1..=8 audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFrame {
    tokens: Vec<u32>,
}

impl TokenFrame {
    /// Wrap raw channel tokens, rejecting frames without all audio channels
    pub fn new(tokens: Vec<u32>) -> Result<Self> {
        if tokens.len() < AUDIO_CHANNELS + 1 {
            return Err(Error::Engine(format!(
                "token frame has {} channels, expected at least {}",
                tokens.len(),
                AUDIO_CHANNELS + 1
            )));
        }
        Ok(Self { tokens })
    }

    pub fn text_token(&self) -> u32 {
        self.tokens[0]
    }

    /// The audio channels handed to [`InferenceEngine::decode`]
    pub fn audio_tokens(&self) -> &[u32] {
        &self.tokens[1..=AUDIO_CHANNELS]
    }
}

/// One unit of priming work.
///
/// A priming run is a deterministic sequence of these, built from the
/// personality: voice prompt frames, silence, text prompt tokens, silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimingStep {
    /// Feed frame `n` of the resident voice prompt
    VoicePrompt(usize),
    /// Feed one frame of silence
    Silence,
    /// Force one text prompt token
    Text(u32),
}

/// Stateful streaming inference engine.
///
/// The engine is not reentrant: exactly one session drives it at a time, and
/// every method may block for the duration of a model step. Callers run it on
/// the blocking pool.
///
/// # Example
///
/// ```ignore
/// let codes = engine.encode(&frame)?;
/// for column in codes.columns() {
///     if let Some(tokens) = engine.step(column, None)? {
///         let pcm = engine.decode(tokens.audio_tokens())?;
///     }
/// }
/// ```
pub trait InferenceEngine: Send + 'static {
    /// Engine name for logging
    fn name(&self) -> &str;

    /// PCM sample rate consumed and produced
    fn sample_rate(&self) -> u32;

    /// Frames per second
    fn frame_rate(&self) -> f32;

    /// Samples per frame
    fn frame_size(&self) -> usize {
        (self.sample_rate() as f32 / self.frame_rate()).round() as usize
    }

    /// Encode one frame of PCM into codes
    fn encode(&mut self, pcm: &[f32]) -> Result<CodeFrame>;

    /// Advance the model by one code column.
    ///
    /// `text_token` forces the text channel instead of sampling it. Returns
    /// `None` while the engine is still buffering.
    fn step(&mut self, codes: &[u32], text_token: Option<u32>) -> Result<Option<TokenFrame>>;

    /// Decode the audio channels of a token frame into PCM
    fn decode(&mut self, audio_tokens: &[u32]) -> Result<Vec<f32>>;

    /// Clear all streaming state (keeps the loaded voice embedding)
    fn reset(&mut self);

    fn apply_sampling(&mut self, sampling: &SamplingConfig);

    fn set_seed(&mut self, seed: u64);

    /// Replace the resident voice embedding.
    ///
    /// Must be atomic: on error the previously resident embedding stays loaded.
    fn load_voice_embedding(&mut self, payload: &[u8]) -> Result<()>;

    /// Use raw audio as the voice prompt, for generating a new embedding
    fn load_voice_prompt_audio(&mut self, pcm: &[f32]) -> Result<()>;

    /// Serialize the voice embedding captured by the last priming run
    fn export_voice_embedding(&self) -> Result<Vec<u8>>;

    /// Number of frames in the resident voice prompt
    fn voice_prompt_frames(&self) -> usize;

    /// Execute one priming step
    fn prime_step(&mut self, step: PrimingStep) -> Result<()>;

    /// Clear encoder state used by priming while keeping the primed context
    fn finish_priming(&mut self);
}
