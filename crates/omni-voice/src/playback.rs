//! Response playback: decode one payload and play it on the default output device.
//!
//! Each `play()` opens its own rodio output stream on a playback thread and releases it
//! when the clip ends, fails or is stopped. Completion is signalled through a
//! `PlaybackCompletion`, which fires exactly once: explicitly, or on drop.

use crate::error::{VoiceError, VoiceResult};
use crate::event::blocking_section;
use bytes::Bytes;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const PLAYBACK_POLL: Duration = Duration::from_millis(20);

/// One-shot completion callback for a `play()` call.
pub struct PlaybackCompletion {
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl PlaybackCompletion {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl Drop for PlaybackCompletion {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for PlaybackCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackCompletion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Output side of the turn loop.
pub trait PlaybackSink: Send {
    /// Play `payload` once; `completion` fires when playback ends for any reason,
    /// including an empty or undecodable payload.
    fn play(&mut self, payload: Bytes, completion: PlaybackCompletion);

    /// Stop any live playback immediately.
    fn stop(&mut self);

    fn is_playing(&self) -> bool;
}

/// A clip currently owned by a playback thread.
pub struct PlaybackHandle {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl PlaybackHandle {
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let thread = self.thread;
        if blocking_section(move || thread.join()).is_err() {
            error!("Playback thread panicked");
        }
    }
}

/// Default-output-device sink built on rodio.
#[derive(Default)]
pub struct RodioPlayback {
    live: Option<PlaybackHandle>,
}

impl RodioPlayback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlaybackSink for RodioPlayback {
    fn play(&mut self, payload: Bytes, completion: PlaybackCompletion) {
        if payload.is_empty() {
            warn!("Empty audio payload, skipping playback");
            completion.complete();
            return;
        }

        if let Some(previous) = self.live.take() {
            if !previous.is_finished() {
                warn!("Playback requested while another clip is live, stopping it");
            }
            previous.stop();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_finished = Arc::clone(&finished);

        let spawned = thread::Builder::new()
            .name("omni-playback".to_string())
            .spawn(move || {
                match play_blocking(payload, &thread_stop) {
                    Ok(()) => debug!("Audio playback finished"),
                    Err(e) => error!("Audio playback failed: {}", e),
                }
                thread_finished.store(true, Ordering::SeqCst);
                completion.complete();
            });

        // On spawn failure the closure (and the completion inside it) is dropped,
        // which fires the completion.
        match spawned {
            Ok(thread) => {
                self.live = Some(PlaybackHandle {
                    stop,
                    finished,
                    thread,
                });
            }
            Err(e) => error!("Could not start playback thread: {}", e),
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.live.take() {
            handle.stop();
            info!("⏹️ Audio playback stopped");
        }
    }

    fn is_playing(&self) -> bool {
        self.live.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for RodioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decode and play to completion (or until `stop` is raised). Output resources are
/// dropped on return.
fn play_blocking(payload: Bytes, stop: &AtomicBool) -> VoiceResult<()> {
    let source = decode(payload)?;

    let (_stream, stream_handle) = OutputStream::try_default().map_err(|e| match e {
        rodio::StreamError::NoDevice => {
            VoiceError::DeviceUnavailable("No output device available".to_string())
        }
        other => VoiceError::Playback(other.to_string()),
    })?;
    let sink = Sink::try_new(&stream_handle).map_err(|e| VoiceError::Playback(e.to_string()))?;

    sink.append(source.convert_samples::<f32>());
    debug!("Audio playback started");

    while !sink.empty() {
        if stop.load(Ordering::SeqCst) {
            sink.stop();
            break;
        }
        thread::sleep(PLAYBACK_POLL);
    }

    Ok(())
}

fn decode(payload: Bytes) -> VoiceResult<Decoder<Cursor<Bytes>>> {
    Decoder::new(Cursor::new(payload)).map_err(|e| VoiceError::Decode(e.to_string()))
}
