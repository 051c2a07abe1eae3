//! Voice embedding generation and preview rendering
//!
//! Both operations drive the engine directly and must run while the caller
//! holds the engine lease. They leave the engine reset and the embedding
//! cache invalidated, since the resident voice no longer matches any
//! personality.

use crate::priming::PrimingPlan;
use crate::runtime::EngineRuntime;
use crate::PipelineError;
use std::io::Cursor;
use voice_gateway_core::wrap_with_system_tags;

impl EngineRuntime {
    /// Turn reference audio into a voice embedding.
    ///
    /// `pcm` must already be at the engine's sample rate. The audio becomes
    /// the voice prompt, `prompt` the system prompt, and the embedding
    /// captured while priming is returned.
    pub fn generate_embedding(
        &mut self,
        pcm: &[f32],
        prompt: &str,
        silence_seconds: f32,
    ) -> Result<Vec<u8>, PipelineError> {
        self.embeddings.invalidate();
        self.engine.reset();

        let result = self
            .engine
            .load_voice_prompt_audio(pcm)
            .map_err(PipelineError::from)
            .and_then(|()| self.prime_blocking(prompt, silence_seconds))
            .and_then(|()| {
                self.engine
                    .export_voice_embedding()
                    .map_err(PipelineError::from)
            });

        self.engine.reset();
        if let Ok(bytes) = &result {
            tracing::info!(
                samples = pcm.len(),
                embedding_bytes = bytes.len(),
                "Generated voice embedding"
            );
        }
        result
    }

    /// Render `seconds` of speech in the voice of `embedding`.
    ///
    /// The engine is primed with `prompt`, then fed silence while the same
    /// prompt tokens are forced one per step so the voice speaks the text.
    pub fn render_preview(
        &mut self,
        embedding: &[u8],
        prompt: &str,
        seconds: f32,
        silence_seconds: f32,
    ) -> Result<Vec<f32>, PipelineError> {
        self.embeddings.invalidate();
        self.engine.reset();

        let result = self
            .engine
            .load_voice_embedding(embedding)
            .map_err(|e| PipelineError::Embedding(e.to_string()))
            .and_then(|()| self.prime_blocking(prompt, silence_seconds))
            .and_then(|()| self.generate_with_forced_text(prompt, seconds));

        self.engine.reset();
        match result {
            Ok(pcm) if pcm.is_empty() => Err(PipelineError::Audio("no audio generated".to_string())),
            other => other,
        }
    }

    fn prime_blocking(&mut self, prompt: &str, silence_seconds: f32) -> Result<(), PipelineError> {
        let tokens = self.tokenizer.encode(&wrap_with_system_tags(prompt))?;
        let silence_frames = (silence_seconds * self.engine.frame_rate()) as usize;
        let plan = PrimingPlan::build(self.engine.voice_prompt_frames(), silence_frames, &tokens);

        for step in plan.steps() {
            self.engine.prime_step(*step)?;
        }
        self.engine.finish_priming();
        Ok(())
    }

    fn generate_with_forced_text(
        &mut self,
        prompt: &str,
        seconds: f32,
    ) -> Result<Vec<f32>, PipelineError> {
        let tokens = self.tokenizer.encode(&wrap_with_system_tags(prompt))?;
        let mut forced = tokens.into_iter();
        let frames = (self.engine.frame_rate() * seconds) as usize;
        let silence = vec![0.0f32; self.engine.frame_size()];

        let mut pcm = Vec::with_capacity(frames * silence.len());
        for _ in 0..frames {
            let codes = self.engine.encode(&silence)?;
            for column in codes.columns() {
                if let Some(tokens) = self.engine.step(column, forced.next())? {
                    pcm.extend(self.engine.decode(tokens.audio_tokens())?);
                }
            }
        }
        Ok(pcm)
    }
}

/// Decode a WAV file into mono `f32` samples and its sample rate.
///
/// Stereo input is averaged down to mono.
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), PipelineError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::Audio(format!("Failed to read WAV: {}", e)))?;

    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(PipelineError::Audio("WAV header has a sample rate of 0".to_string()));
    }
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .filter_map(Result::ok)
            .collect(),
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .filter_map(Result::ok)
                .map(|s| s as f32 / max_val)
                .collect()
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        samples
    };

    tracing::debug!(
        samples = samples.len(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        "Decoded WAV"
    );
    Ok((samples, spec.sample_rate))
}

/// Encode mono `f32` samples as a 16-bit PCM WAV file
pub fn encode_wav(pcm: &[f32], sample_rate: u32) -> Result<Vec<u8>, PipelineError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| PipelineError::Audio(format!("Failed to create WAV: {}", e)))?;
        for &sample in pcm {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| PipelineError::Audio(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| PipelineError::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Resample mono audio with rubato, falling back to linear interpolation
/// for very short inputs or when rubato rejects the rates
pub fn resample(pcm: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || pcm.is_empty() {
        return pcm.to_vec();
    }
    if from_rate == 0 || to_rate == 0 {
        tracing::warn!(from_rate, to_rate, "Cannot resample with a zero rate, leaving audio as is");
        return pcm.to_vec();
    }
    if pcm.len() < 64 {
        return resample_linear(pcm, from_rate, to_rate);
    }

    let chunk_size = pcm.len().min(1024);
    let mut resampler =
        match FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk_size, 2, 1) {
            Ok(resampler) => resampler,
            Err(e) => {
                tracing::warn!("Rubato init failed, using linear fallback: {}", e);
                return resample_linear(pcm, from_rate, to_rate);
            }
        };

    let expected = (pcm.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let mut output = Vec::with_capacity(expected + chunk_size);
    let mut chunks = pcm.chunks_exact(chunk_size);
    for chunk in chunks.by_ref() {
        match resampler.process(std::slice::from_ref(&chunk), None) {
            Ok(frames) => output.extend_from_slice(&frames[0]),
            Err(e) => {
                tracing::warn!("Rubato processing failed, using linear fallback: {}", e);
                return resample_linear(pcm, from_rate, to_rate);
            }
        }
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        match resampler.process_partial(Some(std::slice::from_ref(&tail)), None) {
            Ok(frames) => output.extend_from_slice(&frames[0]),
            Err(e) => {
                tracing::warn!("Rubato processing failed, using linear fallback: {}", e);
                return resample_linear(pcm, from_rate, to_rate);
            }
        }
    }

    // Flush until the delayed tail is out, then drop the leading delay
    let delay = resampler.output_delay();
    for _ in 0..4 {
        if output.len() >= delay + expected {
            break;
        }
        match resampler.process_partial::<&[f32]>(None, None) {
            Ok(frames) => output.extend_from_slice(&frames[0]),
            Err(_) => break,
        }
    }
    output.drain(..delay.min(output.len()));

    output.resize(expected, 0.0);
    output
}

fn resample_linear(pcm: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (pcm.len() as f64 * ratio) as usize;
    let last = pcm.len().saturating_sub(1);

    (0..new_len)
        .map(|i| {
            let src = i as f64 / ratio;
            let floor = (src.floor() as usize).min(last);
            let ceil = (floor + 1).min(last);
            let frac = (src - floor as f64) as f32;
            pcm[floor] * (1.0 - frac) + pcm[ceil] * frac
        })
        .collect()
}
