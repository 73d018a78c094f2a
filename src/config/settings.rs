//! Application settings structs, defaults and TOML persistence.
//!
//! Every section is `#[serde(default)]`, so a hand-written `settings.toml`
//! only needs the keys it wants to override.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

/// Environment variable consulted when `remote.api_key` is not set.
pub const API_KEY_ENV: &str = "LIVE_TUTOR_API_KEY";

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

/// Connection settings for the remote speech session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// WebSocket endpoint (`wss://…`). The API key is appended as `?key=`.
    pub url: String,
    /// API key. `None` falls back to the `LIVE_TUTOR_API_KEY` environment
    /// variable.
    pub api_key: Option<String>,
    /// Model identifier sent in the setup message.
    pub model: String,
    /// Prebuilt voice name for the tutor.
    pub voice: String,
    /// Seconds to wait for the session to be acknowledged.
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".into(),
            api_key: None,
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".into(),
            voice: "Kore".into(),
            connect_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    /// The configured key, or the environment fallback. Blank values count
    /// as missing.
    pub fn resolved_api_key(&self) -> Option<String> {
        pick_api_key(self.api_key.as_deref(), std::env::var(API_KEY_ENV).ok())
    }
}

fn pick_api_key(configured: Option<&str>, from_env: Option<String>) -> Option<String> {
    configured
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .or_else(|| from_env.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()))
}

// ---------------------------------------------------------------------------
// TutorConfig
// ---------------------------------------------------------------------------

/// Defaults for the lesson passed to `connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TutorConfig {
    /// Speaking-rate multiplier. 1.0 is native pace.
    pub speaking_rate: f32,
    /// Scenario instruction. `None` means free conversation.
    pub scenario: Option<String>,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            speaking_rate: 1.0,
            scenario: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Sample rates, frame sizes and timing of the audio paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate of uplink audio in Hz.
    pub input_sample_rate: u32,
    /// Rate of inbound tutor audio in Hz.
    pub output_sample_rate: u32,
    /// Samples per capture frame delivered by the microphone.
    pub capture_frame_size: usize,
    /// Accumulated uplink samples that trigger one send.
    pub uplink_chunk_samples: usize,
    /// Delay after the session opens before capture frames are processed.
    pub capture_settle_ms: u64,
    /// Period of volume-meter updates.
    pub meter_interval_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            capture_frame_size: 4096,
            uplink_chunk_samples: 4096,
            capture_settle_ms: 500,
            meter_interval_ms: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryConfig
// ---------------------------------------------------------------------------

/// How remote errors are classified and how often the session reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reconnect attempts allowed per user-initiated connect.
    pub max_retries: u32,
    /// Pause between teardown and the reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Case-insensitive substrings marking an error as a self-healing
    /// network blip. Checked first.
    pub transient_signatures: Vec<String>,
    /// Case-insensitive substrings marking an error as a remote-side fault
    /// worth one reconnect.
    pub recoverable_signatures: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            reconnect_delay_ms: 500,
            transient_signatures: vec![
                "network error".into(),
                "failed to fetch".into(),
                "connection reset".into(),
                "timed out".into(),
            ],
            recoverable_signatures: vec![
                "internal error".into(),
                "service is currently unavailable".into(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use live_tutor::config::AppConfig;
///
/// // Returns defaults when the file does not exist yet.
/// let config = AppConfig::load().unwrap();
/// assert_eq!(config.audio.input_sample_rate, 16_000);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub tutor: TutorConfig,
    pub audio: AudioConfig,
    pub recovery: RecoveryConfig,
}

impl AppConfig {
    /// Load from the platform `settings.toml`; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save to the platform `settings.toml`, creating parent directories.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
