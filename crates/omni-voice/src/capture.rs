//! Microphone capture gated by voice activity detection.
//!
//! `MicrophoneGate` opens the default input device with cpal, classifies 10–30ms frames
//! with WebRTC VAD and emits one `Utterance` per detected speech segment. The cpal
//! stream and the VAD are not `Send`, so both live on a dedicated capture thread that
//! exits (and releases the device) when the gate is closed.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::event::{blocking_section, ConversationEvent, EventSender};
use crate::segment::{SegmentEvent, UtteranceSegmenter};
use crate::vad::VadDetector;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const FRAME_POLL: Duration = Duration::from_millis(50);

/// One detected speech segment: mono f32 PCM in -1.0..1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: DateTime<Utc>,
    pub duration: Duration,
}

impl Utterance {
    pub fn new(samples: Vec<f32>, sample_rate: u32, duration: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Utc::now(),
            duration,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wire form: little-endian f32 samples, one binary message per utterance.
    pub fn into_wire_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.samples.len() * 4);
        for sample in self.samples {
            buf.put_f32_le(sample);
        }
        buf.freeze()
    }
}

/// Events emitted by a capture gate
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    SpeechStart,
    /// Speech started but was abandoned: too short, or the mic was muted mid-segment
    SpeechCancelled,
    SpeechEnd(Utterance),
    Error(VoiceError),
}

/// One open microphone window, as seen by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureSession {
    pub active: bool,
    pub speaking: bool,
    pub error_state: Option<String>,
}

impl CaptureSession {
    pub fn opened() -> Self {
        Self {
            active: true,
            ..Default::default()
        }
    }

    pub fn failed(err: &VoiceError) -> Self {
        Self {
            active: false,
            speaking: false,
            error_state: Some(err.to_string()),
        }
    }
}

/// Microphone + VAD gate driven by the turn controller.
pub trait AudioCaptureGate: Send {
    /// Acquire the input device and start analysis. Opening an open gate is a no-op.
    fn open(&mut self) -> VoiceResult<()>;

    /// Stop analysis and release the device. Closing a closed gate is a no-op.
    fn close(&mut self);

    /// Discard frames without releasing the device.
    fn set_paused(&mut self, paused: bool);

    fn is_open(&self) -> bool;
}

/// Forwards segmenter output to the conversation queue.
#[derive(Clone)]
pub struct CaptureEmitter {
    events: EventSender,
    sample_rate: u32,
}

impl CaptureEmitter {
    pub fn new(events: EventSender, sample_rate: u32) -> Self {
        Self {
            events,
            sample_rate,
        }
    }

    pub fn speech_start(&self) {
        self.emit(CaptureEvent::SpeechStart);
    }

    /// Emit a completed utterance. Zero-length buffers are VAD false triggers and are
    /// suppressed; returns whether anything was emitted.
    pub fn speech_end(&self, samples: Vec<f32>, duration: Duration) -> bool {
        if samples.is_empty() {
            debug!("VAD speech end with no audio, suppressed");
            return false;
        }
        info!(samples = samples.len(), ?duration, "🎯 Utterance captured");
        self.emit(CaptureEvent::SpeechEnd(Utterance::new(
            samples,
            self.sample_rate,
            duration,
        )));
        true
    }

    pub fn speech_cancelled(&self) {
        self.emit(CaptureEvent::SpeechCancelled);
    }

    pub fn error(&self, err: VoiceError) {
        self.emit(CaptureEvent::Error(err));
    }

    fn emit(&self, event: CaptureEvent) {
        if self.events.send(ConversationEvent::Capture(event)).is_err() {
            debug!("Conversation queue closed, dropping capture event");
        }
    }
}

/// Segmenter plus emitter: turns classified frames into capture events. Lives on the
/// capture thread; kept apart from the VAD so it can be driven without a device.
pub struct FrameProcessor {
    segmenter: UtteranceSegmenter,
    emitter: CaptureEmitter,
    paused: bool,
}

impl FrameProcessor {
    pub fn new(config: &CaptureConfig, emitter: CaptureEmitter) -> Self {
        Self {
            segmenter: UtteranceSegmenter::new(config),
            emitter,
            paused: false,
        }
    }

    /// Apply the mute flag. Muting drops any partial segment; returns true when the
    /// gate has just been unmuted (the VAD should start fresh).
    pub fn set_paused(&mut self, paused: bool) -> bool {
        let resumed = self.paused && !paused;
        if paused && !self.paused && self.segmenter.in_speech() {
            debug!("Muted mid-segment, dropping partial speech");
            self.segmenter.reset();
            self.emitter.speech_cancelled();
        }
        self.paused = paused;
        resumed
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Feed one frame with its VAD decision. Frames are discarded while paused.
    pub fn push(&mut self, is_speech: bool, frame: &[f32]) {
        if self.paused {
            return;
        }

        match self.segmenter.push_frame(is_speech, frame) {
            Some(SegmentEvent::SpeechStarted) => {
                info!("🎤 Speech started");
                self.emitter.speech_start();
            }
            Some(SegmentEvent::SpeechEnded { samples, duration }) => {
                self.emitter.speech_end(samples, duration);
            }
            Some(SegmentEvent::FalseStart { duration }) => {
                debug!(?duration, "Discarded false start");
                self.emitter.speech_cancelled();
            }
            None => {}
        }
    }
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// The default-input-device implementation of `AudioCaptureGate`.
pub struct MicrophoneGate {
    config: CaptureConfig,
    emitter: CaptureEmitter,
    paused: Arc<AtomicBool>,
    worker: Option<CaptureWorker>,
}

impl MicrophoneGate {
    pub fn new(config: CaptureConfig, events: EventSender) -> VoiceResult<Self> {
        config.validate()?;
        let emitter = CaptureEmitter::new(events, config.sample_rate);
        Ok(Self {
            config,
            emitter,
            paused: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

impl AudioCaptureGate for MicrophoneGate {
    fn open(&mut self) -> VoiceResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);

        let config = self.config.clone();
        let emitter = self.emitter.clone();
        let paused = Arc::clone(&self.paused);
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("omni-capture".to_string())
            .spawn(move || capture_thread(config, emitter, paused, thread_stop, ready_tx))?;

        // Device startup can take a while; keep it off the async worker
        blocking_section(move || match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop, thread });
                info!("✅ Microphone armed");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::CaptureFailed(
                    "capture thread exited during startup".to_string(),
                ))
            }
        })
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            if blocking_section(move || worker.thread.join()).is_err() {
                error!("Capture thread panicked");
            }
            self.paused.store(false, Ordering::SeqCst);
            info!("🔇 Microphone released");
        }
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        info!(paused, "Microphone {}", if paused { "muted" } else { "unmuted" });
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for MicrophoneGate {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_thread(
    config: CaptureConfig,
    emitter: CaptureEmitter,
    paused: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::SyncSender<VoiceResult<()>>,
) {
    let (frame_tx, frame_rx) = std_mpsc::channel::<Vec<f32>>();

    let mut vad = match VadDetector::new(&config) {
        Ok(v) => v,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Held until this thread returns; dropping it releases the microphone
    let _stream = match start_stream(&config, frame_tx, emitter.clone()) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    info!(
        frame_ms = config.frame_ms,
        hold_ms = config.hold_ms,
        "👂 Listening for speech"
    );

    let mut frames = FrameProcessor::new(&config, emitter.clone());

    while !stop.load(Ordering::SeqCst) {
        let frame = match frame_rx.recv_timeout(FRAME_POLL) {
            Ok(frame) => frame,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                emitter.error(VoiceError::CaptureFailed("input stream ended".to_string()));
                break;
            }
        };

        if frames.set_paused(paused.load(Ordering::SeqCst)) {
            if let Err(e) = vad.reset() {
                warn!("VAD reset after unmute failed: {}", e);
            }
        }
        if frames.is_paused() {
            continue;
        }

        let is_speech = match vad.is_speech(&frame) {
            Ok(s) => s,
            Err(e) => {
                debug!("VAD frame skipped: {}", e);
                continue;
            }
        };

        frames.push(is_speech, &frame);
    }

    debug!("Capture thread stopping");
}

fn start_stream(
    config: &CaptureConfig,
    frame_tx: std_mpsc::Sender<Vec<f32>>,
    emitter: CaptureEmitter,
) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        sample_rate = config.sample_rate,
        "📱 Opening microphone"
    );

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_len = config.frame_len();
    let mut pending = Vec::with_capacity(frame_len);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(sample);
                if pending.len() == frame_len {
                    let frame = std::mem::replace(&mut pending, Vec::with_capacity(frame_len));
                    if frame_tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        },
        move |err| {
            warn!("Audio input stream error: {}", err);
            let err = match err {
                cpal::StreamError::DeviceNotAvailable => {
                    VoiceError::DeviceUnavailable("input device disconnected".to_string())
                }
                other => VoiceError::CaptureFailed(other.to_string()),
            };
            emitter.error(err);
        },
        None,
    )?;

    stream.play()?;

    Ok(stream)
}
