//! Application State
//!
//! Shared state across all handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use voice_gateway_config::{load_settings, Settings};
use voice_gateway_core::FrameCodec;
use voice_gateway_persistence::{
    EmbeddingDirectory, FilePersonalityStore, ModelSettingsStore, PersonalityStore,
};
use voice_gateway_pipeline::{
    EngineGate, EngineLoader, LoadOptions, LoopbackConfig, LoopbackLoader, Pcm16Codec,
    SentinelSet, SessionOptions,
};

use crate::session::SessionRegistry;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration wrapped in RwLock for hot-reload support
    pub config: Arc<RwLock<Settings>>,
    /// Engine lifecycle; owns the engine slot once loaded
    pub gate: Arc<EngineGate>,
    pub personalities: Arc<dyn PersonalityStore>,
    pub model_settings: Arc<ModelSettingsStore>,
    pub embeddings: Arc<EmbeddingDirectory>,
    /// Wire codec shared by every session
    pub codec: Arc<dyn FrameCodec>,
    pub sessions: Arc<SessionRegistry>,
    /// Prometheus handle when the recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// Environment name for config reload
    env: Option<String>,
}

impl AppState {
    /// Create application state with file-backed stores and the engine
    /// backend named in the configuration
    pub fn new(config: Settings) -> Self {
        let loader: Arc<dyn EngineLoader> =
            Arc::new(LoopbackLoader::new(loopback_config(&config)));
        Self::with_loader(config, loader)
    }

    /// Create application state around a custom engine loader
    pub fn with_loader(config: Settings, loader: Arc<dyn EngineLoader>) -> Self {
        let storage = &config.storage;
        let embeddings =
            EmbeddingDirectory::new(&storage.embeddings_dir, &storage.embedding_extension);
        let personalities: Arc<dyn PersonalityStore> = Arc::new(FilePersonalityStore::new(
            &storage.personalities_dir,
            embeddings.clone(),
        ));
        let model_settings = ModelSettingsStore::new(&storage.settings_dir);

        let gate = EngineGate::new(
            loader,
            LoadOptions {
                warmup_frames: config.engine.warmup_frames,
                seed: Some(config.engine.seed),
            },
        );
        let codec: Arc<dyn FrameCodec> = Arc::new(Pcm16Codec::new(
            config.engine.sample_rate,
            config.codec.packet_samples,
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            gate: Arc::new(gate),
            personalities,
            model_settings: Arc::new(model_settings),
            embeddings: Arc::new(embeddings),
            codec,
            sessions: Arc::new(SessionRegistry::new()),
            metrics: None,
            env: None,
        }
    }

    /// Replace the personality store
    pub fn with_personality_store(mut self, store: Arc<dyn PersonalityStore>) -> Self {
        self.personalities = store;
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Remember the environment name used for config reload
    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env;
        self
    }

    /// Reload configuration from files.
    ///
    /// Session tuning and preview settings take effect for the next session;
    /// storage locations, codec and engine settings need a restart.
    pub fn reload_config(&self) -> Result<(), String> {
        let new_config = load_settings(self.env.as_deref())
            .map_err(|e| format!("Failed to reload config: {}", e))?;

        *self.config.write() = new_config;

        tracing::info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Get current configuration (read-only snapshot)
    pub fn get_config(&self) -> parking_lot::RwLockReadGuard<'_, Settings> {
        self.config.read()
    }

    /// Options for a new chat session
    pub fn session_options(&self) -> SessionOptions {
        let config = self.config.read();
        SessionOptions {
            liveness_timeout: Duration::from_millis(config.session.liveness_probe_ms),
            channel_capacity: config.session.channel_capacity,
            sentinels: SentinelSet::new(config.engine.text_sentinels.iter().copied()),
            silence_seconds: config.priming.silence_seconds,
        }
    }
}

fn loopback_config(config: &Settings) -> LoopbackConfig {
    LoopbackConfig {
        sample_rate: config.engine.sample_rate,
        frame_rate: config.engine.frame_rate,
        delay_steps: config.engine.loopback_delay_steps,
        ..LoopbackConfig::default()
    }
}
