//! Voice Activity Detection using WebRTC VAD
//!
//! Classifies fixed-length frames as speech or silence. `webrtc_vad::Vad` is not
//! `Send`, so a detector must be created on the thread that feeds it.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Voice Activity Detector using WebRTC VAD
pub struct VadDetector {
    vad: Vad,
    sample_rate: u32,
    mode: u8,
    frame_len: usize,
}

impl VadDetector {
    /// Create a new VAD detector from the capture configuration
    pub fn new(config: &CaptureConfig) -> VoiceResult<Self> {
        info!(
            sample_rate = config.sample_rate,
            mode = config.vad_mode,
            frame_ms = config.frame_ms,
            "🎙️ Initializing WebRTC VAD"
        );

        // WebRTC VAD only accepts 10, 20 or 30ms frames
        if !matches!(config.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::VadInit(format!(
                "frame length must be 10, 20 or 30ms, got {}",
                config.frame_ms
            )));
        }
        let frame_len = config.frame_len();

        let vad = build(config.sample_rate, config.vad_mode)?;

        debug!(frame_len, "VAD initialized");

        Ok(Self {
            vad,
            sample_rate: config.sample_rate,
            mode: config.vad_mode,
            frame_len,
        })
    }

    /// Classify one frame. The frame must be exactly `frame_len()` samples.
    pub fn is_speech(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        if frame.len() != self.frame_len {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_len,
                frame.len()
            )));
        }

        let pcm: Vec<i16> = frame
            .iter()
            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        self.vad
            .is_voice_segment(&pcm)
            .map_err(|_| VoiceError::VadProcessing("invalid frame length for VAD".to_string()))
    }

    /// Samples per frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Drop internal VAD history (used when the gate is re-armed)
    pub fn reset(&mut self) -> VoiceResult<()> {
        // WebRTC VAD has no reset; rebuild it
        self.vad = build(self.sample_rate, self.mode)?;
        Ok(())
    }
}

fn build(hz: u32, mode: u8) -> VoiceResult<Vad> {
    let mut vad = Vad::new();
    vad.set_mode(vad_mode(mode)?);
    vad.set_sample_rate(sample_rate(hz)?);
    Ok(vad)
}

fn sample_rate(hz: u32) -> VoiceResult<SampleRate> {
    match hz {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::VadInit(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

fn vad_mode(mode: u8) -> VoiceResult<VadMode> {
    match mode {
        0 => Ok(VadMode::Quality),
        1 => Ok(VadMode::LowBitrate),
        2 => Ok(VadMode::Aggressive),
        3 => Ok(VadMode::VeryAggressive),
        other => Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vad_initialization() {
        let detector = VadDetector::new(&CaptureConfig::default()).unwrap();
        assert_eq!(detector.frame_len(), 480); // 30ms at 16kHz
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = CaptureConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(matches!(VadDetector::new(&config), Err(VoiceError::VadInit(_))));
    }

    #[test]
    fn test_frame_length_validation() {
        let mut detector = VadDetector::new(&CaptureConfig::default()).unwrap();
        let wrong_size = vec![0.0f32; 100];
        assert!(detector.is_speech(&wrong_size).is_err());
    }

    #[test]
    fn test_silence_detection() {
        let mut detector = VadDetector::new(&CaptureConfig::default()).unwrap();
        let silence = vec![0.0f32; 480];
        assert!(!detector.is_speech(&silence).unwrap());
    }

    #[test]
    fn test_short_frames_at_8khz() {
        let config = CaptureConfig {
            sample_rate: 8000,
            frame_ms: 10,
            ..Default::default()
        };
        let mut detector = VadDetector::new(&config).unwrap();
        assert_eq!(detector.frame_len(), 80);
        detector.reset().unwrap();
        assert!(!detector.is_speech(&[0.0; 80]).unwrap());
    }

    #[test]
    fn test_reset_keeps_frame_settings() {
        let mut detector = VadDetector::new(&CaptureConfig::default()).unwrap();
        let tone: Vec<f32> = (0..480).map(|i| (i as f32 * 0.2).sin() * 0.5).collect();
        detector.is_speech(&tone).unwrap();

        detector.reset().unwrap();
        assert_eq!(detector.frame_len(), 480);
        assert!(!detector.is_speech(&vec![0.0f32; 480]).unwrap());
        assert!(detector.is_speech(&vec![0.0f32; 100]).is_err());
    }
}
