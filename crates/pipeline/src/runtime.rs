//! Loaded engine runtime and exclusive access to it
//!
//! Once the gate has loaded a model, the engine, its tokenizer and the
//! embedding cache live together in an [`EngineRuntime`] behind an
//! [`EngineSlot`]. Sessions take an [`EngineLease`] from the slot: an owned
//! guard that is moved into whichever task drives the engine and released
//! when dropped. Waiters queue in FIFO order.

use crate::embedding_cache::{EmbeddingCache, EmbeddingLoad};
use crate::priming::PrimingPlan;
use crate::PipelineError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use voice_gateway_core::{InferenceEngine, PersonalityConfig, PromptText, TextTokenizer};

/// Everything a session needs from the loaded model
pub struct EngineRuntime {
    pub engine: Box<dyn InferenceEngine>,
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub embeddings: EmbeddingCache,
    sessions_served: u64,
}

/// Result of preparing the engine for a session
#[derive(Debug, Clone)]
pub struct PreparedSession {
    pub plan: PrimingPlan,
    pub prompt_tokens: usize,
    /// `None` when the personality has no voice embedding
    pub embedding: Option<EmbeddingLoad>,
}

impl EngineRuntime {
    pub fn new(engine: Box<dyn InferenceEngine>, tokenizer: Arc<dyn TextTokenizer>) -> Self {
        Self {
            engine,
            tokenizer,
            embeddings: EmbeddingCache::new(),
            sessions_served: 0,
        }
    }

    pub fn sessions_served(&self) -> u64 {
        self.sessions_served
    }

    /// Tokens for a system prompt: the tagged text followed by the untagged suffix
    pub fn tokenize_prompt(&self, prompt: &PromptText) -> Result<Vec<u32>, PipelineError> {
        let mut tokens = self.tokenizer.encode(&prompt.system)?;
        if let Some(additional) = &prompt.additional {
            tokens.extend(self.tokenizer.encode(additional)?);
        }
        Ok(tokens)
    }

    /// Run silent frames through encode, step and decode, then reset
    pub fn warmup(&mut self, frames: usize) -> Result<(), PipelineError> {
        let silence = vec![0.0f32; self.engine.frame_size()];
        for _ in 0..frames {
            let codes = self.engine.encode(&silence)?;
            for column in codes.columns() {
                if let Some(tokens) = self.engine.step(column, None)? {
                    self.engine.decode(tokens.audio_tokens())?;
                }
            }
        }
        self.engine.reset();
        Ok(())
    }

    /// Apply a personality's sampling, seed and voice, and build its priming plan.
    ///
    /// Streaming state is reset before the embedding is loaded.
    pub fn prepare_session(
        &mut self,
        personality: &PersonalityConfig,
        silence_seconds: f32,
    ) -> Result<PreparedSession, PipelineError> {
        self.engine.apply_sampling(&personality.sampling());
        if let Some(seed) = personality.seed_override() {
            self.engine.set_seed(seed);
        }
        self.engine.reset();

        let embedding = match personality.embedding_payload() {
            Some(payload) => Some(self.embeddings.load(
                self.engine.as_mut(),
                &personality.cache_key(),
                payload,
            )?),
            None => None,
        };

        let tokens = match personality.prompt_text() {
            Some(prompt) => self.tokenize_prompt(&prompt)?,
            None => Vec::new(),
        };

        let voice_frames = if embedding.is_some() {
            self.engine.voice_prompt_frames()
        } else {
            0
        };
        let silence_frames = (silence_seconds * self.engine.frame_rate()) as usize;
        self.sessions_served += 1;

        Ok(PreparedSession {
            plan: PrimingPlan::build(voice_frames, silence_frames, &tokens),
            prompt_tokens: tokens.len(),
            embedding,
        })
    }
}

/// Static facts about the loaded engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub sample_rate: u32,
    pub frame_rate: f32,
    pub frame_size: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Exclusive-access slot around the engine runtime
pub struct EngineSlot {
    runtime: Arc<tokio::sync::Mutex<EngineRuntime>>,
    holder: Arc<Mutex<Option<String>>>,
    waiting: AtomicUsize,
    info: EngineInfo,
}

impl EngineSlot {
    pub fn new(runtime: EngineRuntime) -> Self {
        let info = EngineInfo {
            name: runtime.engine.name().to_string(),
            sample_rate: runtime.engine.sample_rate(),
            frame_rate: runtime.engine.frame_rate(),
            frame_size: runtime.engine.frame_size(),
            loaded_at: Utc::now(),
        };
        Self {
            runtime: Arc::new(tokio::sync::Mutex::new(runtime)),
            holder: Arc::new(Mutex::new(None)),
            waiting: AtomicUsize::new(0),
            info,
        }
    }

    pub fn info(&self) -> &EngineInfo {
        &self.info
    }

    /// Id of the current lease holder
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }

    /// Number of callers queued in [`acquire`](Self::acquire)
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for exclusive access. Waiters are served in arrival order.
    pub async fn acquire(&self, holder: &str) -> EngineLease {
        let started = Instant::now();
        let guard = {
            let _queued = WaitingGuard::enter(&self.waiting);
            Arc::clone(&self.runtime).lock_owned().await
        };
        let waited = started.elapsed();
        metrics::histogram!("gateway_engine_lock_wait_seconds").record(waited.as_secs_f64());
        tracing::debug!(holder = %holder, waited_ms = waited.as_millis() as u64, "Acquired engine lease");
        self.lease(guard, holder)
    }

    /// Take the lease only if nobody holds it
    pub fn try_acquire(&self, holder: &str) -> Option<EngineLease> {
        let guard = Arc::clone(&self.runtime).try_lock_owned().ok()?;
        Some(self.lease(guard, holder))
    }

    fn lease(&self, guard: OwnedMutexGuard<EngineRuntime>, holder: &str) -> EngineLease {
        *self.holder.lock() = Some(holder.to_string());
        EngineLease {
            guard,
            holder: Arc::clone(&self.holder),
            holder_id: holder.to_string(),
            acquired_at: Instant::now(),
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let waiting = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("gateway_sessions_waiting").set(waiting as f64);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let waiting = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("gateway_sessions_waiting").set(waiting as f64);
    }
}

/// Exclusive access to the engine runtime; released on drop
pub struct EngineLease {
    guard: OwnedMutexGuard<EngineRuntime>,
    holder: Arc<Mutex<Option<String>>>,
    holder_id: String,
    acquired_at: Instant,
}

impl EngineLease {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Run `f` on the blocking pool with the lease moved in, and hand the
    /// lease back when it finishes.
    ///
    /// Engine calls are never interrupted part-way: dropping the returned
    /// future leaves `f` running, and the lease is released once it returns.
    pub async fn run_blocking<F, T>(self, f: F) -> Result<(Self, T), PipelineError>
    where
        F: FnOnce(&mut EngineRuntime) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (lease, output) = tokio::task::spawn_blocking(move || {
            let mut lease = self;
            let output = f(&mut lease);
            (lease, output)
        })
        .await?;
        Ok((lease, output))
    }
}

impl Deref for EngineLease {
    type Target = EngineRuntime;

    fn deref(&self) -> &EngineRuntime {
        &self.guard
    }
}

impl DerefMut for EngineLease {
    fn deref_mut(&mut self) -> &mut EngineRuntime {
        &mut self.guard
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let mut holder = self.holder.lock();
        if holder.as_deref() == Some(self.holder_id.as_str()) {
            *holder = None;
        }
        tracing::debug!(
            holder = %self.holder_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released engine lease"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{LoopbackConfig, LoopbackEngine};
    use std::time::Duration;
    use voice_gateway_core::Result as CoreResult;

    struct CharTokenizer;

    impl TextTokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> CoreResult<Vec<u32>> {
            Ok(text.chars().map(|c| c as u32).collect())
        }

        fn id_to_piece(&self, id: u32) -> Option<String> {
            char::from_u32(id).map(String::from)
        }
    }

    fn runtime() -> EngineRuntime {
        EngineRuntime::new(
            Box::new(LoopbackEngine::new(LoopbackConfig::default())),
            Arc::new(CharTokenizer),
        )
    }

    #[test]
    fn test_tokenize_prompt_appends_additional_text() {
        let runtime = runtime();
        let prompt = PromptText {
            system: "<s>".to_string(),
            additional: Some("ab".to_string()),
        };
        let tokens = runtime.tokenize_prompt(&prompt).unwrap();
        assert_eq!(tokens, vec!['<' as u32, 's' as u32, '>' as u32, 'a' as u32, 'b' as u32]);
    }

    #[test]
    fn test_prepare_session_without_embedding() {
        let mut runtime = runtime();
        let personality = PersonalityConfig::new("p", "P").with_description("hi");

        let prepared = runtime.prepare_session(&personality, 0.5).unwrap();
        assert!(prepared.embedding.is_none());
        // "<system> hi <system>" tokenizes one token per char
        assert_eq!(prepared.prompt_tokens, "<system> hi <system>".len());
        assert_eq!(prepared.plan.len(), 6 + prepared.prompt_tokens + 6);
        assert_eq!(runtime.sessions_served(), 1);
    }

    #[test]
    fn test_resaved_voice_is_reloaded() {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let voice = |level: f32| {
            let bytes: Vec<u8> = [level; 16].iter().flat_map(|s| s.to_le_bytes()).collect();
            STANDARD.encode(bytes)
        };
        let mut runtime = runtime();
        let original = PersonalityConfig::new("p", "P").with_embedding_data(voice(0.1));
        let revoiced = PersonalityConfig::new("p", "P").with_embedding_data(voice(0.7));

        let first = runtime.prepare_session(&original, 0.5).unwrap();
        assert_eq!(first.embedding, Some(EmbeddingLoad::Loaded));
        let again = runtime.prepare_session(&original, 0.5).unwrap();
        assert_eq!(again.embedding, Some(EmbeddingLoad::AlreadyResident));

        let changed = runtime.prepare_session(&revoiced, 0.5).unwrap();
        assert_eq!(changed.embedding, Some(EmbeddingLoad::Loaded));
        assert_eq!(runtime.embeddings.load_count(), 2);
    }

    #[test]
    fn test_prepare_session_rejects_bad_embedding() {
        let mut runtime = runtime();
        let personality = PersonalityConfig::new("p", "P").with_embedding_data("%%%");

        let result = runtime.prepare_session(&personality, 0.5);
        assert!(matches!(result, Err(PipelineError::Embedding(_))));
        assert!(runtime.embeddings.resident_key().is_none());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let slot = EngineSlot::new(runtime());

        let lease = slot.acquire("a").await;
        assert_eq!(slot.holder().as_deref(), Some("a"));
        assert!(slot.try_acquire("b").is_none());

        drop(lease);
        assert_eq!(slot.holder(), None);
        assert!(slot.try_acquire("b").is_some());
    }

    #[tokio::test]
    async fn test_queued_waiter_is_counted_and_served() {
        let slot = Arc::new(EngineSlot::new(runtime()));
        let first = slot.acquire("a").await;

        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                let lease = slot.acquire("b").await;
                lease.holder_id().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.waiting(), 1);

        drop(first);
        let served = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(served, "b");
        assert_eq!(slot.waiting(), 0);
    }

    #[tokio::test]
    async fn test_run_blocking_returns_lease() {
        let slot = EngineSlot::new(runtime());
        let lease = slot.acquire("a").await;

        let (lease, frame_size) = lease
            .run_blocking(|runtime| runtime.engine.frame_size())
            .await
            .unwrap();
        assert_eq!(frame_size, 1920);
        assert_eq!(lease.holder_id(), "a");
    }
}
