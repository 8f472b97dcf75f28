//! Error types for the Omni voice conversation client

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice conversation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio capture failed: {0}")]
    CaptureFailed(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    #[error("No response from backend within {secs}s")]
    ResponseTimeout { secs: u64 },

    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Fatal errors end the session until the user retries or restarts it.
    /// Everything else is recovered by returning to listening.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_)
                | VoiceError::DeviceUnavailable(_)
                | VoiceError::ConnectionLost { .. }
        )
    }

    /// Errors that `retry()` cannot clear; the conversation must be reopened.
    pub fn requires_restart(&self) -> bool {
        matches!(self, VoiceError::ConnectionLost { .. })
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable(err.to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => backend_error(err.description),
            other => VoiceError::CaptureFailed(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                VoiceError::DeviceUnavailable(err.to_string())
            }
            cpal::PlayStreamError::BackendSpecific { err } => backend_error(err.description),
        }
    }
}

/// Backends report a denied microphone as a generic backend error; sort it by message.
fn backend_error(description: String) -> VoiceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        VoiceError::PermissionDenied(description)
    } else {
        VoiceError::CaptureFailed(description)
    }
}
