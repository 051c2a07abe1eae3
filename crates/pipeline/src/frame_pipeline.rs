//! Audio frame pipeline
//!
//! Turns decoded client PCM into outbound frames:
//!
//! ```text
//! PCM ─▶ AudioFrameBuffer ─▶ encode ─▶ step (per code column) ─┬─▶ decode ─▶ StreamEncoder ─▶ Audio
//!                                                               └─▶ text token ─▶ Text
//! ```
//!
//! Everything produced for frame *i* is returned before frame *i + 1* is
//! touched, so outbound order follows inbound order.

use crate::runtime::EngineLease;
use crate::PipelineError;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use voice_gateway_core::{AudioFrameBuffer, ServerFrame, StreamEncoder};

/// Text tokens that carry no content (padding) and are never sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelSet(HashSet<u32>);

impl SentinelSet {
    pub fn new(tokens: impl IntoIterator<Item = u32>) -> Self {
        Self(tokens.into_iter().collect())
    }

    pub fn contains(&self, token: u32) -> bool {
        self.0.contains(&token)
    }
}

impl Default for SentinelSet {
    /// End-of-padding (0) and padding (3)
    fn default() -> Self {
        Self::new([0, 3])
    }
}

/// Counters for one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub steps: u64,
    pub audio_chunks: u64,
    pub text_tokens: u64,
}

/// Per-session frame processor; owns the engine lease while live
pub struct AudioFramePipeline {
    lease: EngineLease,
    buffer: AudioFrameBuffer,
    encoder: Box<dyn StreamEncoder>,
    sentinels: SentinelSet,
    stats: PipelineStats,
}

impl AudioFramePipeline {
    pub fn new(lease: EngineLease, encoder: Box<dyn StreamEncoder>, sentinels: SentinelSet) -> Self {
        let frame_size = lease.engine.frame_size();
        Self {
            lease,
            buffer: AudioFrameBuffer::new(frame_size),
            encoder,
            sentinels,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Samples waiting for a complete frame
    pub fn residual(&self) -> usize {
        self.buffer.residual()
    }

    /// Samples accepted by the codec encoder but not yet emitted
    pub fn pending_encoder_samples(&self) -> usize {
        self.encoder.pending_samples()
    }

    /// Give up the pipeline, keeping the lease
    pub fn into_lease(self) -> EngineLease {
        self.lease
    }

    /// Buffer `pcm` and process every complete frame, oldest first
    pub fn push_pcm(&mut self, pcm: &[f32]) -> Result<Vec<ServerFrame>, PipelineError> {
        self.buffer.append(pcm);
        let mut out = Vec::new();
        while let Some(frame) = self.buffer.pop_frame() {
            let started = Instant::now();
            self.process_frame(&frame, &mut out)?;
            metrics::histogram!("gateway_frame_processing_seconds")
                .record(started.elapsed().as_secs_f64());
        }
        Ok(out)
    }

    fn process_frame(
        &mut self,
        frame: &[f32],
        out: &mut Vec<ServerFrame>,
    ) -> Result<(), PipelineError> {
        let runtime = &mut *self.lease;
        let codes = runtime.engine.encode(frame)?;
        self.stats.frames += 1;

        for column in codes.columns() {
            let Some(tokens) = runtime.engine.step(column, None)? else {
                continue;
            };
            self.stats.steps += 1;

            let pcm = runtime.engine.decode(tokens.audio_tokens())?;
            self.encoder.append_pcm(&pcm)?;
            let encoded = self.encoder.read_bytes();
            if !encoded.is_empty() {
                self.stats.audio_chunks += 1;
                out.push(ServerFrame::Audio(encoded));
            }

            let text_token = tokens.text_token();
            if self.sentinels.contains(text_token) {
                continue;
            }
            match runtime.tokenizer.render_piece(text_token) {
                Some(piece) => {
                    self.stats.text_tokens += 1;
                    out.push(ServerFrame::Text(piece));
                }
                None => tracing::warn!(token = text_token, "Text token has no vocabulary piece"),
            }
        }
        Ok(())
    }

    /// [`push_pcm`](Self::push_pcm) on the blocking pool.
    ///
    /// The outer error means the blocking task itself failed and the
    /// pipeline (with its lease) is gone.
    pub async fn push_pcm_blocking(
        mut self,
        pcm: Vec<f32>,
    ) -> Result<(Self, Result<Vec<ServerFrame>, PipelineError>), PipelineError> {
        let result = tokio::task::spawn_blocking(move || {
            let frames = self.push_pcm(&pcm);
            (self, frames)
        })
        .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{LoopbackConfig, LoopbackEngine, Pcm16Codec};
    use crate::runtime::{EngineRuntime, EngineSlot};
    use std::sync::Arc;
    use voice_gateway_core::{FrameCodec, Result as CoreResult, TextTokenizer};

    struct NullTokenizer;

    impl TextTokenizer for NullTokenizer {
        fn encode(&self, _text: &str) -> CoreResult<Vec<u32>> {
            Ok(vec![])
        }

        fn id_to_piece(&self, _id: u32) -> Option<String> {
            None
        }
    }

    fn config() -> LoopbackConfig {
        LoopbackConfig {
            sample_rate: 800,
            frame_rate: 10.0,
            delay_steps: 0,
            ..LoopbackConfig::default()
        }
    }

    async fn pipeline(slot: &EngineSlot) -> AudioFramePipeline {
        let codec = Pcm16Codec::new(800, 40);
        let lease = slot.acquire("test").await;
        AudioFramePipeline::new(lease, codec.encoder(), SentinelSet::default())
    }

    #[test]
    fn test_default_sentinels() {
        let sentinels = SentinelSet::default();
        assert!(sentinels.contains(0));
        assert!(sentinels.contains(3));
        assert!(!sentinels.contains(1));
    }

    #[tokio::test]
    async fn test_partial_frames_produce_nothing() {
        let slot = EngineSlot::new(EngineRuntime::new(
            Box::new(LoopbackEngine::new(config())),
            Arc::new(NullTokenizer),
        ));
        let mut pipeline = pipeline(&slot).await;

        let out = pipeline.push_pcm(&[0.1; 50]).unwrap();
        assert!(out.is_empty());
        assert_eq!(pipeline.residual(), 50);
        assert_eq!(pipeline.stats().frames, 0);
    }

    #[tokio::test]
    async fn test_each_frame_yields_audio_and_padding_is_silent() {
        let slot = EngineSlot::new(EngineRuntime::new(
            Box::new(LoopbackEngine::new(config())),
            Arc::new(NullTokenizer),
        ));
        let mut pipeline = pipeline(&slot).await;

        // 80 samples per frame; 200 samples = 2 frames + 40 residual
        let out = pipeline.push_pcm(&[0.25; 200]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| matches!(f, ServerFrame::Audio(b) if b.len() == 160)));
        assert_eq!(pipeline.residual(), 40);
        assert_eq!(pipeline.pending_encoder_samples(), 0);

        let stats = pipeline.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.text_tokens, 0);
    }

    #[tokio::test]
    async fn test_blocking_variant_returns_pipeline() {
        let slot = EngineSlot::new(EngineRuntime::new(
            Box::new(LoopbackEngine::new(config())),
            Arc::new(NullTokenizer),
        ));
        let pipeline = pipeline(&slot).await;

        let (pipeline, frames) = pipeline.push_pcm_blocking(vec![0.0; 80]).await.unwrap();
        assert_eq!(frames.unwrap().len(), 1);

        drop(pipeline.into_lease());
        assert!(slot.try_acquire("next").is_some());
    }
}
