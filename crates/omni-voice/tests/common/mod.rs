//! In-memory gate, transport and playback used to drive the controller without hardware.

#![allow(dead_code)]

use bytes::Bytes;
use omni_voice::{
    AudioCaptureGate, ConnectionState, ConversationConfig, EventReceiver, EventSender,
    HostNotice, PlaybackCompletion, PlaybackSink, TransportChannel, TurnController,
    TurnState, Utterance, VoiceError, VoiceResult,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct GateRecord {
    pub open: bool,
    pub paused: bool,
    pub opens: usize,
    pub closes: usize,
    pub fail_next_open: Option<VoiceError>,
}

#[derive(Clone, Default)]
pub struct FakeGate(pub Arc<Mutex<GateRecord>>);

impl FakeGate {
    pub fn record(&self) -> MutexGuard<'_, GateRecord> {
        self.0.lock().unwrap()
    }
}

impl AudioCaptureGate for FakeGate {
    fn open(&mut self) -> VoiceResult<()> {
        let mut record = self.record();
        if let Some(err) = record.fail_next_open.take() {
            return Err(err);
        }
        if !record.open {
            record.open = true;
            record.opens += 1;
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut record = self.record();
        if record.open {
            record.open = false;
            record.paused = false;
            record.closes += 1;
        }
    }

    fn set_paused(&mut self, paused: bool) {
        self.record().paused = paused;
    }

    fn is_open(&self) -> bool {
        self.0.lock().unwrap().open
    }
}

#[derive(Debug)]
pub struct TransportRecord {
    pub state: ConnectionState,
    pub sent: Vec<Bytes>,
    pub closed: bool,
    pub reject_sends: bool,
}

impl Default for TransportRecord {
    fn default() -> Self {
        Self {
            state: ConnectionState::Open,
            sent: Vec::new(),
            closed: false,
            reject_sends: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeTransport(pub Arc<Mutex<TransportRecord>>);

impl FakeTransport {
    pub fn record(&self) -> MutexGuard<'_, TransportRecord> {
        self.0.lock().unwrap()
    }
}

impl TransportChannel for FakeTransport {
    fn send(&self, payload: Bytes) -> bool {
        let mut record = self.record();
        if record.state != ConnectionState::Open || record.reject_sends {
            return false;
        }
        record.sent.push(payload);
        true
    }

    fn state(&self) -> ConnectionState {
        self.0.lock().unwrap().state
    }

    fn close(&self) {
        let mut record = self.record();
        record.closed = true;
        record.state = ConnectionState::Closed;
    }
}

#[derive(Debug, Default)]
pub struct PlaybackRecord {
    pub played: Vec<Bytes>,
    pub stops: usize,
    pub pending: Option<PlaybackCompletion>,
}

/// Holds each completion until the test calls `finish()` (or `stop()` drops it).
#[derive(Clone, Default)]
pub struct FakePlayback(pub Arc<Mutex<PlaybackRecord>>);

impl FakePlayback {
    pub fn record(&self) -> MutexGuard<'_, PlaybackRecord> {
        self.0.lock().unwrap()
    }

    /// Complete the live clip as if it had played to the end.
    pub fn finish(&self) {
        let completion = self.record().pending.take();
        if let Some(completion) = completion {
            completion.complete();
        }
    }
}

impl PlaybackSink for FakePlayback {
    fn play(&mut self, payload: Bytes, completion: PlaybackCompletion) {
        let mut record = self.record();
        record.played.push(payload);
        record.pending = Some(completion);
    }

    fn stop(&mut self) {
        let completion = {
            let mut record = self.record();
            record.stops += 1;
            record.pending.take()
        };
        drop(completion);
    }

    fn is_playing(&self) -> bool {
        self.0.lock().unwrap().pending.is_some()
    }
}

pub struct Harness {
    pub controller: TurnController,
    pub events: EventReceiver,
    pub events_tx: EventSender,
    pub notices: mpsc::UnboundedReceiver<HostNotice>,
    pub gate: FakeGate,
    pub transport: FakeTransport,
    pub playback: FakePlayback,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&ConversationConfig::default())
    }

    pub fn with_config(config: &ConversationConfig) -> Self {
        let (events_tx, events) = omni_voice::event_channel();
        let gate = FakeGate::default();
        let transport = FakeTransport::default();
        let playback = FakePlayback::default();

        let (controller, notices) = TurnController::new(
            config,
            Box::new(gate.clone()),
            Box::new(transport.clone()),
            Box::new(playback.clone()),
            events_tx.clone(),
        );

        Self {
            controller,
            events,
            events_tx,
            notices,
            gate,
            transport,
            playback,
        }
    }

    /// Feed every queued event to the controller.
    pub fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle_event(event);
            self.assert_exclusive();
        }
    }

    pub fn assert_exclusive(&self) {
        assert!(
            !(self.gate.is_open() && self.playback.is_playing()),
            "gate open while playback is live (state {})",
            self.controller.state()
        );
    }

    pub fn transitions(&mut self) -> Vec<(TurnState, TurnState)> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            if let HostNotice::StateChanged { from, to } = notice {
                out.push((from, to));
            }
        }
        out
    }

    pub fn errors(&mut self) -> Vec<(VoiceError, bool)> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            if let HostNotice::Error { error, fatal } = notice {
                out.push((error, fatal));
            }
        }
        out
    }
}

pub fn utterance(samples: usize) -> Utterance {
    Utterance::new(vec![0.25; samples], 16000, Duration::from_millis(samples as u64 / 16))
}
