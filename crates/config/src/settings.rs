//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// HTTP/WebSocket server
    #[serde(default)]
    pub server: ServerConfig,

    /// On-disk locations for personalities, settings and embeddings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Inference engine backend and decoding
    #[serde(default)]
    pub engine: EngineConfig,

    /// Frame codec
    #[serde(default)]
    pub codec: CodecConfig,

    /// System prompt priming
    #[serde(default)]
    pub priming: PrimingConfig,

    /// Live session loops
    #[serde(default)]
    pub session: SessionConfig,

    /// Embedding preview rendering
    #[serde(default)]
    pub preview: PreviewConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_engine()?;
        self.validate_codec()?;
        self.validate_session()?;
        self.validate_priming()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port cannot be 0".to_string(),
            });
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.request_timeout_seconds".to_string(),
                message: "Timeout must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }

    fn validate_engine(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;

        if engine.text_sentinels.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "engine.text_sentinels".to_string(),
                message: "At least one padding token is required".to_string(),
            });
        }

        if engine.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.sample_rate".to_string(),
                message: "Sample rate cannot be 0".to_string(),
            });
        }

        if engine.frame_rate.is_nan()
            || engine.frame_rate <= 0.0
            || engine.frame_rate > engine.sample_rate as f32
        {
            return Err(ConfigError::InvalidValue {
                field: "engine.frame_rate".to_string(),
                message: format!(
                    "Must be between 0 and the sample rate, got {}",
                    engine.frame_rate
                ),
            });
        }

        if engine.backend != "loopback" {
            return Err(ConfigError::InvalidValue {
                field: "engine.backend".to_string(),
                message: format!("Unknown engine backend '{}'", engine.backend),
            });
        }

        Ok(())
    }

    fn validate_codec(&self) -> Result<(), ConfigError> {
        if self.codec.packet_samples == 0 {
            return Err(ConfigError::InvalidValue {
                field: "codec.packet_samples".to_string(),
                message: "Packet size must be at least 1 sample".to_string(),
            });
        }
        Ok(())
    }

    fn validate_session(&self) -> Result<(), ConfigError> {
        if self.session.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.channel_capacity".to_string(),
                message: "Channel capacity must be at least 1".to_string(),
            });
        }
        if self.session.liveness_probe_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.liveness_probe_ms".to_string(),
                message: "Liveness probe timeout must be at least 1ms".to_string(),
            });
        }
        Ok(())
    }

    fn validate_priming(&self) -> Result<(), ConfigError> {
        if self.priming.silence_seconds < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "priming.silence_seconds".to_string(),
                message: "Cannot be negative".to_string(),
            });
        }
        if self.preview.seconds.is_nan() || self.preview.seconds <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "preview.seconds".to_string(),
                message: format!("Must be positive, got {}", self.preview.seconds),
            });
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout for REST requests (WebSocket sessions are not affected)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed origins; empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8998
}

fn default_request_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// One JSON file per personality
    #[serde(default = "default_personalities_dir")]
    pub personalities_dir: String,

    /// Holds `settings.json` with the model weight paths
    #[serde(default = "default_settings_dir")]
    pub settings_dir: String,

    /// Voice embedding files
    #[serde(default = "default_embeddings_dir")]
    pub embeddings_dir: String,

    /// Extension given to generated embedding files
    #[serde(default = "default_embedding_extension")]
    pub embedding_extension: String,
}

fn default_personalities_dir() -> String {
    "Personalities".to_string()
}

fn default_settings_dir() -> String {
    "Settings".to_string()
}

fn default_embeddings_dir() -> String {
    "voices".to_string()
}

fn default_embedding_extension() -> String {
    ".emb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            personalities_dir: default_personalities_dir(),
            settings_dir: default_settings_dir(),
            embeddings_dir: default_embeddings_dir(),
            embedding_extension: default_embedding_extension(),
        }
    }
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend used by the engine loader
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Text tokens that are padding and never sent to clients
    #[serde(default = "default_text_sentinels")]
    pub text_sentinels: Vec<u32>,

    /// Silent frames run through the engine after loading
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: usize,

    /// Seed applied once after loading
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,

    /// Steps the loopback backend buffers before producing output
    #[serde(default = "default_loopback_delay")]
    pub loopback_delay_steps: usize,
}

fn default_backend() -> String {
    "loopback".to_string()
}

fn default_text_sentinels() -> Vec<u32> {
    vec![0, 3]
}

fn default_warmup_frames() -> usize {
    4
}

fn default_seed() -> u64 {
    42424242
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_frame_rate() -> f32 {
    12.5
}

fn default_loopback_delay() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            text_sentinels: default_text_sentinels(),
            warmup_frames: default_warmup_frames(),
            seed: default_seed(),
            sample_rate: default_sample_rate(),
            frame_rate: default_frame_rate(),
            loopback_delay_steps: default_loopback_delay(),
        }
    }
}

/// Frame codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Samples per encoded packet
    #[serde(default = "default_packet_samples")]
    pub packet_samples: usize,
}

fn default_packet_samples() -> usize {
    480
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            packet_samples: default_packet_samples(),
        }
    }
}

/// Priming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimingConfig {
    /// Silence fed before and after the text prompt
    #[serde(default = "default_silence_seconds")]
    pub silence_seconds: f32,

    /// Prompt used when generating or previewing embeddings without one
    #[serde(default = "default_prompt")]
    pub default_prompt: String,
}

fn default_silence_seconds() -> f32 {
    0.5
}

fn default_prompt() -> String {
    "You enjoy having a good conversation.".to_string()
}

impl Default for PrimingConfig {
    fn default() -> Self {
        Self {
            silence_seconds: default_silence_seconds(),
            default_prompt: default_prompt(),
        }
    }
}

impl PrimingConfig {
    /// Silence frames for an engine running at `frame_rate`
    pub fn silence_frames(&self, frame_rate: f32) -> usize {
        (self.silence_seconds * frame_rate) as usize
    }
}

/// Live session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a liveness probe waits for a close before reporting alive
    #[serde(default = "default_liveness_probe_ms")]
    pub liveness_probe_ms: u64,

    /// Capacity of the channels between the receive, process and send tasks
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_liveness_probe_ms() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_probe_ms: default_liveness_probe_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Embedding preview configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_preview_seconds")]
    pub seconds: f32,
}

fn default_preview_seconds() -> f32 {
    5.0
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            seconds: default_preview_seconds(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Install the Prometheus recorder and serve `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from `config/` in the working directory
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from("config", env)
}

/// Load settings from `{dir}/default.*`, `{dir}/{env}.*` and the environment
pub fn load_settings_from(dir: &str, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name(&format!("{}/default", dir)).required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("{}/{}", dir, env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_GATEWAY")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8998);
        assert_eq!(settings.engine.text_sentinels, vec![0, 3]);
        assert_eq!(settings.engine.warmup_frames, 4);
        assert_eq!(settings.session.liveness_probe_ms, 10);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_silence_frames() {
        let priming = PrimingConfig::default();
        assert_eq!(priming.silence_frames(12.5), 6);
    }

    #[test]
    fn test_empty_sentinels_rejected() {
        let mut settings = Settings::default();
        settings.engine.text_sentinels.clear();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("engine.text_sentinels"));
    }

    #[test]
    fn test_session_validation() {
        let mut settings = Settings::default();
        settings.session.channel_capacity = 0;
        assert!(settings.validate_session().is_err());

        settings.session.channel_capacity = 8;
        settings.session.liveness_probe_ms = 0;
        assert!(settings.validate_session().is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut settings = Settings::default();
        settings.engine.backend = "gpu".to_string();
        assert!(settings.validate_engine().is_err());
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[server]\nport = 9100\n\n[engine]\ntext_sentinels = [0, 3, 7]\n",
        )
        .unwrap();
        fs::write(dir.path().join("staging.toml"), "environment = \"staging\"\n").unwrap();

        let settings =
            load_settings_from(dir.path().to_str().unwrap(), Some("staging")).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.engine.text_sentinels, vec![0, 3, 7]);
        assert_eq!(settings.environment, RuntimeEnvironment::Staging);
        assert_eq!(settings.storage.personalities_dir, "Personalities");
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.toml"), "[codec]\npacket_samples = 0\n").unwrap();

        assert!(load_settings_from(dir.path().to_str().unwrap(), None).is_err());
    }

    #[test]
    fn test_settings_serialize() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["storage"]["embeddings_dir"], "voices");
    }
}
