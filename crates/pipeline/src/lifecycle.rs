//! Engine lifecycle gate
//!
//! Models are loaded on demand, once, off the async runtime. The gate is the
//! single place that knows whether the engine is usable:
//!
//! ```text
//! NotLoaded ──request_load──▶ Loading ──ok──▶ Ready
//!                               │
//!                               └──err──▶ Failed ──request_load──▶ Loading
//! ```
//!
//! Sessions ask the gate for the engine slot and are turned away immediately
//! unless it is `Ready`.

use crate::runtime::{EngineRuntime, EngineSlot};
use crate::PipelineError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use voice_gateway_core::{InferenceEngine, TextTokenizer, WeightPaths};

const WAITING_MESSAGE: &str = "Waiting for model paths...";

/// Lifecycle phase of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePhase {
    NotLoaded,
    Loading,
    Ready,
    Failed(String),
}

impl EnginePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePhase::NotLoaded => "not_loaded",
            EnginePhase::Loading => "loading",
            EnginePhase::Ready => "ready",
            EnginePhase::Failed(_) => "failed",
        }
    }
}

/// Snapshot reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub ready: bool,
    pub loading: bool,
    pub phase: &'static str,
    /// Human-readable progress or error message
    pub status: String,
}

/// Accepted load request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAccepted {
    /// Loading started in the background
    Started,
    /// Nothing to do; the engine is already usable
    AlreadyLoaded,
}

/// Rejected load request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadRejected {
    #[error("Models are already loading")]
    AlreadyLoading,

    #[error("Missing model paths: {}", .0.join(", "))]
    MissingPaths(Vec<&'static str>),
}

/// Engine produced by an [`EngineLoader`]
pub struct LoadedEngine {
    pub engine: Box<dyn InferenceEngine>,
    pub tokenizer: Arc<dyn TextTokenizer>,
}

/// Builds an engine from weight paths. Runs on the blocking pool.
pub trait EngineLoader: Send + Sync + 'static {
    /// Load all artifacts, reporting human-readable progress through `progress`
    fn load(
        &self,
        paths: &WeightPaths,
        progress: &dyn Fn(&str),
    ) -> Result<LoadedEngine, PipelineError>;
}

/// Work done after the loader returns
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub warmup_frames: usize,
    /// Seed applied once the engine is loaded
    pub seed: Option<u64>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            warmup_frames: 4,
            seed: None,
        }
    }
}

struct GateState {
    phase: EnginePhase,
    message: String,
    slot: Option<Arc<EngineSlot>>,
}

impl GateState {
    fn status(&self) -> GateStatus {
        GateStatus {
            ready: self.phase == EnginePhase::Ready,
            loading: self.phase == EnginePhase::Loading,
            phase: self.phase.as_str(),
            status: self.message.clone(),
        }
    }
}

/// Owns the engine once loaded and gates access to it
pub struct EngineGate {
    state: Mutex<GateState>,
    status_tx: watch::Sender<GateStatus>,
    loader: Arc<dyn EngineLoader>,
    options: LoadOptions,
}

impl EngineGate {
    pub fn new(loader: Arc<dyn EngineLoader>, options: LoadOptions) -> Self {
        let state = GateState {
            phase: EnginePhase::NotLoaded,
            message: WAITING_MESSAGE.to_string(),
            slot: None,
        };
        let (status_tx, _) = watch::channel(state.status());
        Self {
            state: Mutex::new(state),
            status_tx,
            loader,
            options,
        }
    }

    pub fn phase(&self) -> EnginePhase {
        self.state.lock().phase.clone()
    }

    pub fn status(&self) -> GateStatus {
        self.state.lock().status()
    }

    /// Receive every status change
    pub fn subscribe(&self) -> watch::Receiver<GateStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().phase == EnginePhase::Ready
    }

    /// Engine slot, or `NotReady` without waiting
    pub fn slot(&self) -> Result<Arc<EngineSlot>, PipelineError> {
        let state = self.state.lock();
        match (&state.phase, &state.slot) {
            (EnginePhase::Ready, Some(slot)) => Ok(Arc::clone(slot)),
            _ => Err(PipelineError::NotReady(state.message.clone())),
        }
    }

    /// Start loading the engine in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn request_load(
        self: &Arc<Self>,
        paths: &WeightPaths,
    ) -> Result<LoadAccepted, LoadRejected> {
        let paths = paths.cleaned();
        {
            let mut state = self.state.lock();
            match state.phase {
                EnginePhase::Loading => return Err(LoadRejected::AlreadyLoading),
                EnginePhase::Ready => return Ok(LoadAccepted::AlreadyLoaded),
                EnginePhase::NotLoaded | EnginePhase::Failed(_) => {}
            }

            let missing = paths.missing();
            if !missing.is_empty() {
                return Err(LoadRejected::MissingPaths(missing));
            }

            state.phase = EnginePhase::Loading;
            state.message = "Loading...".to_string();
            self.publish(&state);
        }

        metrics::counter!("gateway_engine_load_requests_total").increment(1);
        tracing::info!(
            lm = %paths.lm_weights_path,
            codec = %paths.codec_weights_path,
            tokenizer = %paths.tokenizer_path,
            "Starting model load"
        );

        let gate = Arc::clone(self);
        tokio::spawn(async move { gate.run_load(paths).await });
        Ok(LoadAccepted::Started)
    }

    async fn run_load(self: Arc<Self>, paths: WeightPaths) {
        let gate = Arc::clone(&self);
        let result = tokio::task::spawn_blocking(move || {
            let progress = |message: &str| gate.set_message(message);
            let loaded = gate.loader.load(&paths, &progress)?;

            progress("Warming up...");
            let mut runtime = EngineRuntime::new(loaded.engine, loaded.tokenizer);
            runtime.warmup(gate.options.warmup_frames)?;
            if let Some(seed) = gate.options.seed {
                runtime.engine.set_seed(seed);
            }
            Ok::<_, PipelineError>(runtime)
        })
        .await;

        match result {
            Ok(Ok(runtime)) => self.finish(Ok(runtime)),
            Ok(Err(e)) => self.finish(Err(e.to_string())),
            Err(e) => self.finish(Err(format!("loader panicked: {}", e))),
        }
    }

    fn finish(&self, result: Result<EngineRuntime, String>) {
        let mut state = self.state.lock();
        match result {
            Ok(runtime) => {
                let slot = EngineSlot::new(runtime);
                tracing::info!(
                    engine = %slot.info().name,
                    frame_size = slot.info().frame_size,
                    "All models loaded and warmed up, ready for connections"
                );
                state.slot = Some(Arc::new(slot));
                state.phase = EnginePhase::Ready;
                state.message = "Ready".to_string();
                metrics::counter!("gateway_engine_loads_total", "outcome" => "ready").increment(1);
            }
            Err(message) => {
                tracing::error!(error = %message, "Failed to load models");
                state.slot = None;
                state.phase = EnginePhase::Failed(message.clone());
                state.message = format!("Error: {}", message);
                metrics::counter!("gateway_engine_loads_total", "outcome" => "failed").increment(1);
            }
        }
        self.publish(&state);
    }

    fn set_message(&self, message: &str) {
        let mut state = self.state.lock();
        if state.phase == EnginePhase::Loading {
            tracing::info!(status = %message, "Model load progress");
            state.message = message.to_string();
            self.publish(&state);
        }
    }

    fn publish(&self, state: &GateState) {
        self.status_tx.send_replace(state.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{LoopbackConfig, LoopbackEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use voice_gateway_core::Result as CoreResult;

    struct NullTokenizer;

    impl TextTokenizer for NullTokenizer {
        fn encode(&self, _text: &str) -> CoreResult<Vec<u32>> {
            Ok(vec![])
        }

        fn id_to_piece(&self, _id: u32) -> Option<String> {
            None
        }
    }

    /// Loader that blocks until released, fails on demand and counts calls
    struct ScriptedLoader {
        release: std::sync::Mutex<std::sync::mpsc::Receiver<bool>>,
        calls: AtomicUsize,
    }

    impl EngineLoader for ScriptedLoader {
        fn load(
            &self,
            _paths: &WeightPaths,
            progress: &dyn Fn(&str),
        ) -> Result<LoadedEngine, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress("Loading language model...");
            let succeed = self.release.lock().unwrap().recv().unwrap_or(false);
            if !succeed {
                return Err(PipelineError::Load("weights are corrupt".into()));
            }
            Ok(LoadedEngine {
                engine: Box::new(LoopbackEngine::new(LoopbackConfig::default())),
                tokenizer: Arc::new(NullTokenizer),
            })
        }
    }

    fn gate() -> (Arc<EngineGate>, std::sync::mpsc::Sender<bool>, Arc<ScriptedLoader>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let loader = Arc::new(ScriptedLoader {
            release: std::sync::Mutex::new(rx),
            calls: AtomicUsize::new(0),
        });
        let gate = Arc::new(EngineGate::new(loader.clone(), LoadOptions::default()));
        (gate, tx, loader)
    }

    fn paths() -> WeightPaths {
        WeightPaths::new("lm.bin", "codec.bin", "tokenizer.json")
    }

    async fn wait_settled(gate: &EngineGate) -> GateStatus {
        let mut rx = gate.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| !s.loading))
            .await
            .expect("load did not settle")
            .expect("gate dropped");
        status.clone()
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (gate, _tx, _) = gate();
        let status = gate.status();
        assert!(!status.ready);
        assert!(!status.loading);
        assert_eq!(status.status, WAITING_MESSAGE);
        assert!(matches!(gate.slot(), Err(PipelineError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_missing_paths_rejected_without_transition() {
        let (gate, _tx, loader) = gate();
        let result = gate.request_load(&WeightPaths::new(" ", "codec", "\"\""));
        assert_eq!(
            result,
            Err(LoadRejected::MissingPaths(vec!["lmWeightsPath", "tokenizerPath"]))
        );
        assert_eq!(gate.phase(), EnginePhase::NotLoaded);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_rejections_are_distinguishable() {
        let (gate, tx, loader) = gate();

        assert_eq!(gate.request_load(&paths()), Ok(LoadAccepted::Started));
        assert_eq!(gate.phase(), EnginePhase::Loading);
        assert_eq!(gate.request_load(&paths()), Err(LoadRejected::AlreadyLoading));
        assert!(matches!(gate.slot(), Err(PipelineError::NotReady(_))));

        tx.send(true).unwrap();
        let status = wait_settled(&gate).await;
        assert!(status.ready);
        assert_eq!(status.status, "Ready");

        assert_eq!(gate.request_load(&paths()), Ok(LoadAccepted::AlreadyLoaded));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(gate.slot().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_load_can_be_retried() {
        let (gate, tx, loader) = gate();

        gate.request_load(&paths()).unwrap();
        tx.send(false).unwrap();
        let status = wait_settled(&gate).await;
        assert!(!status.ready);
        assert_eq!(status.phase, "failed");
        assert!(status.status.starts_with("Error: "));
        assert!(matches!(gate.phase(), EnginePhase::Failed(_)));

        assert_eq!(gate.request_load(&paths()), Ok(LoadAccepted::Started));
        tx.send(true).unwrap();
        assert!(wait_settled(&gate).await.ready);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_messages_are_published() {
        let (gate, tx, _) = gate();
        let mut rx = gate.subscribe();

        gate.request_load(&paths()).unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.status == "Loading language model..."),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(status.loading);

        tx.send(true).unwrap();
        wait_settled(&gate).await;
    }
}
