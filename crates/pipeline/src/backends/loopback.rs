//! Deterministic loopback engine
//!
//! Each frame is summarized into one code column of [`AUDIO_CHANNELS`]
//! segment means, quantized to [`CODE_LEVELS`] levels. Columns come back out
//! of [`step`](InferenceEngine::step) after `delay_steps` further steps and
//! decode to a piecewise-constant waveform, so the gateway can be exercised
//! end to end without model weights.
//!
//! Voice embeddings are little-endian `f32` segment means, one group of
//! [`AUDIO_CHANNELS`] values per voice prompt frame.

use crate::lifecycle::{EngineLoader, LoadedEngine};
use crate::PipelineError;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use voice_gateway_core::{
    CodeFrame, Error, InferenceEngine, PrimingStep, Result, SamplingConfig, TokenFrame,
    WeightPaths, AUDIO_CHANNELS,
};

use super::HfTokenizer;

/// Quantization levels per code
pub const CODE_LEVELS: u32 = 2048;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub sample_rate: u32,
    pub frame_rate: f32,
    /// Steps between a column going in and coming out
    pub delay_steps: usize,
    /// Text token emitted when none is forced
    pub pad_token: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            frame_rate: 12.5,
            delay_steps: 1,
            pad_token: 3,
        }
    }
}

type VoiceFrame = [f32; AUDIO_CHANNELS];

pub struct LoopbackEngine {
    config: LoopbackConfig,
    frame_size: usize,
    delay: VecDeque<(Vec<u32>, Option<u32>)>,
    sampling: SamplingConfig,
    seed: u64,
    voice: Vec<VoiceFrame>,
    captured: Vec<VoiceFrame>,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        let frame_size = (config.sample_rate as f32 / config.frame_rate).round() as usize;
        Self {
            config,
            frame_size,
            delay: VecDeque::new(),
            sampling: SamplingConfig::default(),
            seed: 0,
            voice: Vec::new(),
            captured: Vec::new(),
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        self.sampling
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn segment(&self) -> usize {
        (self.frame_size / AUDIO_CHANNELS).max(1)
    }

    fn summarize(&self, pcm: &[f32]) -> VoiceFrame {
        let segment = self.segment();
        let mut means = [0.0f32; AUDIO_CHANNELS];
        for (i, mean) in means.iter_mut().enumerate() {
            let start = (i * segment).min(pcm.len());
            let end = ((i + 1) * segment).min(pcm.len());
            let chunk = &pcm[start..end];
            if !chunk.is_empty() {
                *mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
            }
        }
        means
    }

    fn quantize(frame: &VoiceFrame) -> Vec<u32> {
        let max = (CODE_LEVELS - 1) as f32;
        frame
            .iter()
            .map(|v| (((v.clamp(-1.0, 1.0) + 1.0) / 2.0) * max).round() as u32)
            .collect()
    }

    fn dequantize(code: u32) -> f32 {
        let max = (CODE_LEVELS - 1) as f32;
        (code.min(CODE_LEVELS - 1) as f32 / max) * 2.0 - 1.0
    }

    fn silence_codes() -> Vec<u32> {
        Self::quantize(&[0.0; AUDIO_CHANNELS])
    }
}

impl InferenceEngine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn frame_rate(&self) -> f32 {
        self.config.frame_rate
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn encode(&mut self, pcm: &[f32]) -> Result<CodeFrame> {
        if pcm.len() != self.frame_size {
            return Err(Error::Engine(format!(
                "expected {} samples per frame, got {}",
                self.frame_size,
                pcm.len()
            )));
        }
        Ok(CodeFrame::new(vec![Self::quantize(&self.summarize(pcm))]))
    }

    fn step(&mut self, codes: &[u32], text_token: Option<u32>) -> Result<Option<TokenFrame>> {
        if codes.len() != AUDIO_CHANNELS {
            return Err(Error::Engine(format!(
                "expected {} codes per step, got {}",
                AUDIO_CHANNELS,
                codes.len()
            )));
        }

        self.delay.push_back((codes.to_vec(), text_token));
        if self.delay.len() <= self.config.delay_steps {
            return Ok(None);
        }

        let Some((codes, text)) = self.delay.pop_front() else {
            return Ok(None);
        };
        let mut tokens = Vec::with_capacity(AUDIO_CHANNELS + 1);
        tokens.push(text.unwrap_or(self.config.pad_token));
        tokens.extend(codes);
        TokenFrame::new(tokens).map(Some)
    }

    fn decode(&mut self, audio_tokens: &[u32]) -> Result<Vec<f32>> {
        if audio_tokens.len() != AUDIO_CHANNELS {
            return Err(Error::Engine(format!(
                "expected {} audio tokens, got {}",
                AUDIO_CHANNELS,
                audio_tokens.len()
            )));
        }

        let segment = self.segment();
        let mut pcm = Vec::with_capacity(self.frame_size);
        for &code in audio_tokens {
            pcm.extend(std::iter::repeat(Self::dequantize(code)).take(segment));
        }
        pcm.resize(self.frame_size, 0.0);
        Ok(pcm)
    }

    fn reset(&mut self) {
        self.delay.clear();
        self.captured.clear();
    }

    fn apply_sampling(&mut self, sampling: &SamplingConfig) {
        self.sampling = *sampling;
    }

    fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn load_voice_embedding(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() % 4 != 0 {
            return Err(Error::Embedding(format!(
                "payload of {} bytes is not a sequence of f32 values",
                payload.len()
            )));
        }

        let values: Vec<f32> = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Embedding("payload contains non-finite values".to_string()));
        }

        self.voice = values
            .chunks(AUDIO_CHANNELS)
            .map(|chunk| {
                let mut frame = [0.0f32; AUDIO_CHANNELS];
                frame[..chunk.len()].copy_from_slice(chunk);
                frame
            })
            .collect();
        Ok(())
    }

    fn load_voice_prompt_audio(&mut self, pcm: &[f32]) -> Result<()> {
        if pcm.is_empty() {
            return Err(Error::Embedding("voice prompt audio is empty".to_string()));
        }
        self.voice = pcm
            .chunks(self.frame_size)
            .map(|frame| self.summarize(frame))
            .collect();
        Ok(())
    }

    fn export_voice_embedding(&self) -> Result<Vec<u8>> {
        if self.captured.is_empty() {
            return Err(Error::Embedding(
                "no voice prompt was primed since the last reset".to_string(),
            ));
        }
        Ok(self
            .captured
            .iter()
            .flat_map(|frame| frame.iter())
            .flat_map(|v| v.to_le_bytes())
            .collect())
    }

    fn voice_prompt_frames(&self) -> usize {
        self.voice.len()
    }

    fn prime_step(&mut self, step: PrimingStep) -> Result<()> {
        match step {
            PrimingStep::VoicePrompt(index) => {
                let frame = *self.voice.get(index).ok_or_else(|| {
                    Error::Engine(format!(
                        "voice prompt frame {} out of range ({} resident)",
                        index,
                        self.voice.len()
                    ))
                })?;
                self.step(&Self::quantize(&frame), None)?;
                self.captured.push(frame);
            }
            PrimingStep::Silence => {
                self.step(&Self::silence_codes(), None)?;
            }
            PrimingStep::Text(token) => {
                self.step(&Self::silence_codes(), Some(token))?;
            }
        }
        Ok(())
    }

    fn finish_priming(&mut self) {
        self.delay.clear();
    }
}

/// Loads a [`LoopbackEngine`] after checking that every weight file exists
#[derive(Debug, Clone, Default)]
pub struct LoopbackLoader {
    config: LoopbackConfig,
}

impl LoopbackLoader {
    pub fn new(config: LoopbackConfig) -> Self {
        Self { config }
    }

    fn require_file(path: &str, what: &str) -> std::result::Result<(), PipelineError> {
        if Path::new(path).is_file() {
            Ok(())
        } else {
            Err(PipelineError::Load(format!("{} not found: {}", what, path)))
        }
    }
}

impl EngineLoader for LoopbackLoader {
    fn load(
        &self,
        paths: &WeightPaths,
        progress: &dyn Fn(&str),
    ) -> std::result::Result<LoadedEngine, PipelineError> {
        progress("Loading codec model...");
        Self::require_file(&paths.codec_weights_path, "Codec weights")?;

        progress("Loading tokenizer...");
        let tokenizer = HfTokenizer::from_file(&paths.tokenizer_path)
            .map_err(|e| PipelineError::Load(e.to_string()))?;

        progress("Loading language model...");
        Self::require_file(&paths.lm_weights_path, "Language model weights")?;

        tracing::info!(
            sample_rate = self.config.sample_rate,
            frame_rate = self.config.frame_rate,
            vocab_size = tokenizer.vocab_size(),
            "Loopback engine loaded"
        );
        Ok(LoadedEngine {
            engine: Box::new(LoopbackEngine::new(self.config.clone())),
            tokenizer: Arc::new(tokenizer),
        })
    }
}
