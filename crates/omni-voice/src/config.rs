//! Conversation configuration loaded from file and environment.
//!
//! Precedence: env `OMNI_CONFIG` path > `config/conversation.toml` > defaults, with
//! `OMNI_<SECTION>__<KEY>` environment overrides on top (e.g. `OMNI_TRANSPORT__URL`).
//!
//! | Section | Key | Default | Description |
//! |---------|-----|---------|-------------|
//! | capture | sample_rate | 16000 | Mic/VAD sample rate (8000, 16000, 32000 or 48000). |
//! | capture | vad_mode | 2 | WebRTC VAD aggressiveness, 0 (quality) to 3 (very aggressive). |
//! | capture | frame_ms | 30 | VAD frame length (10, 20 or 30). |
//! | capture | hold_ms | 800 | Silence after speech before the utterance is committed. |
//! | capture | min_speech_ms | 200 | Shorter segments are dropped as false triggers. |
//! | capture | max_utterance_ms | 30000 | Long utterances are committed early. |
//! | transport | url | ws://localhost:8000/ws/conversation | Conversation endpoint. |
//! | transport | reconnect_attempts | 5 | Attempts after an unexpected close. |
//! | transport | reconnect_interval_ms | 3000 | Fixed wait between attempts. |
//! | conversation | response_timeout_secs | 30 | Wait for backend audio before giving up on a turn. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/conversation";

fn default_sample_rate() -> u32 {
    16000
}

fn default_vad_mode() -> u8 {
    2
}

fn default_frame_ms() -> u32 {
    30
}

fn default_hold_ms() -> u64 {
    800
}

fn default_min_speech_ms() -> u64 {
    200
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

fn default_url() -> String {
    "ws://localhost:8000/ws/conversation".to_string()
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}

fn default_response_timeout_secs() -> u64 {
    30
}

/// Microphone + VAD settings handed to the capture gate at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Mic and VAD sample rate in Hz (8000, 16000, 32000 or 48000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// WebRTC VAD aggressiveness, 0 (quality) to 3 (very aggressive)
    #[serde(default = "default_vad_mode")]
    pub vad_mode: u8,
    /// VAD frame length in milliseconds (10, 20 or 30)
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    /// Silence after speech before the utterance is committed (ms)
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    /// Segments shorter than this are treated as VAD misfires (ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    /// Utterances reaching this length are committed early (ms)
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            vad_mode: default_vad_mode(),
            frame_ms: default_frame_ms(),
            hold_ms: default_hold_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_utterance_ms: default_max_utterance_ms(),
        }
    }
}

impl CaptureConfig {
    /// Samples per VAD frame.
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "capture.sample_rate must be 8000, 16000, 32000 or 48000 Hz, got {}",
                self.sample_rate
            )));
        }
        if self.vad_mode > 3 {
            return Err(VoiceError::Config(format!(
                "capture.vad_mode must be 0-3, got {}",
                self.vad_mode
            )));
        }
        if !matches!(self.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "capture.frame_ms must be 10, 20 or 30, got {}",
                self.frame_ms
            )));
        }
        if self.hold_ms == 0 {
            return Err(VoiceError::Config("capture.hold_ms must be positive".to_string()));
        }
        if self.max_utterance_ms <= self.min_speech_ms {
            return Err(VoiceError::Config(format!(
                "capture.max_utterance_ms ({}) must exceed capture.min_speech_ms ({})",
                self.max_utterance_ms, self.min_speech_ms
            )));
        }
        Ok(())
    }
}

/// Reconnect behaviour after an unexpected close. A fixed interval between a bounded
/// number of attempts; zero attempts disables reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            interval: Duration::from_millis(default_reconnect_interval_ms()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Conversation WebSocket endpoint
    #[serde(default = "default_url")]
    pub url: String,
    /// Reconnect attempts after an unexpected close (0 disables reconnecting)
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Fixed wait between reconnect attempts (ms)
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl TransportConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// How long to wait for backend audio after an utterance is sent (seconds)
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl ConversationConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Full client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Microphone, VAD and segmentation
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Backend endpoint and reconnect policy
    #[serde(default)]
    pub transport: TransportConfig,
    /// Turn-level behaviour
    #[serde(default)]
    pub conversation: ConversationConfig,
}

impl VoiceConfig {
    /// Load from `OMNI_CONFIG` (or `config/conversation.toml`) and `OMNI_*` env vars.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("OMNI_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit file path (a missing file falls back to defaults) plus env overrides.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        // `config` resolves "config/conversation" to "config/conversation.toml" itself
        let built = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("OMNI")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: VoiceConfig = built.try_deserialize()?;
        config.capture.validate()?;
        Ok(config)
    }
}
