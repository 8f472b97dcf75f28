//! Utterance segmentation over VAD decisions.
//!
//! Implements the hold-time gap logic: an utterance starts on the first speech frame
//! and is committed once silence has lasted `hold` (800ms by default). Silence inside
//! an utterance is kept only if speech resumes, so the committed buffer never carries
//! the trailing hold period.

use crate::config::CaptureConfig;
use std::time::Duration;
use tracing::{debug, info};

/// What a single frame did to the current segment
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// First speech frame of a new segment
    SpeechStarted,

    /// Hold time elapsed (or max length reached); the segment is complete
    SpeechEnded {
        samples: Vec<f32>,
        duration: Duration,
    },

    /// Segment ended but was shorter than the minimum speech duration
    FalseStart { duration: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Speaking,
    Trailing,
}

/// Frame-driven segmenter. Timing is derived from frame counts, not wall clock, so it
/// behaves the same whether frames arrive live or from a buffer.
pub struct UtteranceSegmenter {
    state: SegmentState,
    frame_duration: Duration,
    hold: Duration,
    min_speech: Duration,
    max_utterance: Duration,

    buffer: Vec<f32>,
    trailing: Vec<f32>,
    speech_time: Duration,
    silence_time: Duration,
}

impl UtteranceSegmenter {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            state: SegmentState::Idle,
            frame_duration: Duration::from_millis(config.frame_ms as u64),
            hold: config.hold(),
            min_speech: config.min_speech(),
            max_utterance: config.max_utterance(),
            buffer: Vec::new(),
            trailing: Vec::new(),
            speech_time: Duration::ZERO,
            silence_time: Duration::ZERO,
        }
    }

    /// Feed one classified frame.
    pub fn push_frame(&mut self, is_speech: bool, frame: &[f32]) -> Option<SegmentEvent> {
        match (self.state, is_speech) {
            (SegmentState::Idle, false) => None,

            (SegmentState::Idle, true) => {
                debug!("Speech started");
                self.state = SegmentState::Speaking;
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                self.speech_time = self.frame_duration;
                Some(SegmentEvent::SpeechStarted)
            }

            (SegmentState::Speaking, true) => {
                self.buffer.extend_from_slice(frame);
                self.speech_time += self.frame_duration;
                if self.speech_time >= self.max_utterance {
                    info!(duration = ?self.speech_time, "Max utterance length reached, committing");
                    return Some(self.commit());
                }
                None
            }

            (SegmentState::Speaking, false) => {
                self.state = SegmentState::Trailing;
                self.trailing.clear();
                self.trailing.extend_from_slice(frame);
                self.silence_time = self.frame_duration;
                self.check_hold()
            }

            // Speech resumed inside the hold window: keep the pause
            (SegmentState::Trailing, true) => {
                self.state = SegmentState::Speaking;
                self.buffer.append(&mut self.trailing);
                self.buffer.extend_from_slice(frame);
                self.speech_time += self.silence_time + self.frame_duration;
                self.silence_time = Duration::ZERO;
                if self.speech_time >= self.max_utterance {
                    return Some(self.commit());
                }
                None
            }

            (SegmentState::Trailing, false) => {
                self.trailing.extend_from_slice(frame);
                self.silence_time += self.frame_duration;
                self.check_hold()
            }
        }
    }

    fn check_hold(&mut self) -> Option<SegmentEvent> {
        if self.silence_time >= self.hold {
            Some(self.commit())
        } else {
            None
        }
    }

    fn commit(&mut self) -> SegmentEvent {
        let duration = self.speech_time;
        let samples = std::mem::take(&mut self.buffer);
        self.reset();

        if duration < self.min_speech {
            debug!(?duration, "Segment shorter than minimum speech, dropping");
            return SegmentEvent::FalseStart { duration };
        }

        SegmentEvent::SpeechEnded { samples, duration }
    }

    /// Abandon any partial segment.
    pub fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.buffer.clear();
        self.trailing.clear();
        self.speech_time = Duration::ZERO;
        self.silence_time = Duration::ZERO;
    }

    pub fn in_speech(&self) -> bool {
        self.state != SegmentState::Idle
    }
}
