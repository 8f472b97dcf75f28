//! Half-duplex turn controller.
//!
//! The only owner of `TurnState`. Every input (capture, transport, playback completion,
//! response timer) arrives as a `ConversationEvent`; host commands arrive as method
//! calls. Capture and playback are never active together: the gate is closed before an
//! utterance leaves and reopened only after playback has finished.
//!
//! ```text
//! Idle ─start─▶ Listening ─speech end─▶ Transmitting ─sent─▶ AwaitingResponse
//!                  ▲                                              │
//!                  └──────── playback finished ◀── Playing ◀─audio┘
//! ```

use crate::capture::{AudioCaptureGate, CaptureEvent, CaptureSession, Utterance};
use crate::config::ConversationConfig;
use crate::error::VoiceError;
use crate::event::{ConversationEvent, EventSender};
use crate::playback::{PlaybackCompletion, PlaybackSink};
use crate::transport::{ConnectionState, TransportChannel, TransportEvent};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Call not started
    Idle,
    /// Mic open, waiting for speech
    Listening,
    /// Utterance captured, being handed to the transport
    Transmitting,
    /// Sent, waiting for backend audio
    AwaitingResponse,
    /// Response audio playing
    Playing,
    /// An error is shown; `retry()` re-arms the mic unless the channel is lost
    Faulted,
    /// Call closed by the user
    Ended,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Transmitting => "transmitting",
            TurnState::AwaitingResponse => "awaiting_response",
            TurnState::Playing => "playing",
            TurnState::Faulted => "faulted",
            TurnState::Ended => "ended",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the host UI
#[derive(Debug, Clone, PartialEq)]
pub enum HostNotice {
    StateChanged { from: TurnState, to: TurnState },
    Error { error: VoiceError, fatal: bool },
    /// The call is over; the host should tear down its view
    CallEnded,
}

/// Point-in-time view of the conversation (status line / debug panel).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSnapshot {
    pub state: TurnState,
    pub connection: ConnectionState,
    pub muted: bool,
    pub capture: Option<CaptureSession>,
    pub playing: bool,
    pub turn: u64,
    pub last_error: Option<String>,
}

impl fmt::Display for ConversationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mic = match (&self.capture, self.muted) {
            (Some(c), false) if c.active => "On",
            (Some(c), true) if c.active => "Muted",
            _ => "Off",
        };
        let speaking = self.capture.as_ref().map_or(false, |c| c.speaking);
        let mic_error = self
            .capture
            .as_ref()
            .and_then(|c| c.error_state.as_deref())
            .unwrap_or("None");

        write!(
            f,
            "WS: {} | Turn: {} | Mic: {} | Speaking: {} | Playing: {} | Mic Error: {}",
            self.connection,
            self.state,
            mic,
            if speaking { "Yes" } else { "No" },
            if self.playing { "Yes" } else { "No" },
            mic_error,
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " | Last Error: {}", err)?;
        }
        Ok(())
    }
}

pub struct TurnController {
    state: TurnState,

    gate: Box<dyn AudioCaptureGate>,
    transport: Box<dyn TransportChannel>,
    playback: Box<dyn PlaybackSink>,

    events: EventSender,
    notices: mpsc::UnboundedSender<HostNotice>,

    capture: Option<CaptureSession>,
    muted: bool,
    last_error: Option<VoiceError>,
    /// Reconnects exhausted; only a new session can talk to the backend again
    channel_lost: bool,

    turn: u64,
    playback_id: u64,
    response_timeout: Duration,
    response_deadline: Option<Instant>,
}

impl TurnController {
    /// `events` is the sender side of the queue this controller is fed from; playback
    /// completions are posted back through it.
    pub fn new(
        config: &ConversationConfig,
        gate: Box<dyn AudioCaptureGate>,
        transport: Box<dyn TransportChannel>,
        playback: Box<dyn PlaybackSink>,
        events: EventSender,
    ) -> (Self, mpsc::UnboundedReceiver<HostNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();

        let controller = Self {
            state: TurnState::Idle,
            gate,
            transport,
            playback,
            events,
            notices,
            capture: None,
            muted: false,
            last_error: None,
            channel_lost: false,
            turn: 0,
            playback_id: 0,
            response_timeout: config.response_timeout(),
            response_deadline: None,
        };

        (controller, notice_rx)
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// True once the transport has given up reconnecting. `start`/`retry` are refused
    /// from then on; the host has to open a new conversation.
    pub fn channel_lost(&self) -> bool {
        self.channel_lost
    }

    pub fn last_error(&self) -> Option<&VoiceError> {
        self.last_error.as_ref()
    }

    pub fn capture_session(&self) -> Option<&CaptureSession> {
        self.capture.as_ref()
    }

    /// When the current response wait expires, if one is running.
    pub fn response_deadline(&self) -> Option<Instant> {
        self.response_deadline
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            state: self.state,
            connection: self.transport.state(),
            muted: self.muted,
            capture: self.capture.clone(),
            playing: self.playback.is_playing(),
            turn: self.turn,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    /// Begin the call (`Idle`) or re-arm the mic after a fault (`Faulted`).
    pub fn start(&mut self) {
        match self.state {
            TurnState::Idle | TurnState::Faulted if self.channel_lost => {
                warn!("⛔ Conversation channel lost, restart the call to reconnect");
            }
            TurnState::Idle | TurnState::Faulted => {
                info!(from = %self.state, "🚀 Starting conversation");
                self.last_error = None;
                self.listen();
            }
            TurnState::Ended => warn!("Call already ended, start ignored"),
            other => debug!(state = %other, "Conversation already running"),
        }
    }

    /// Retry after a fatal error (same as `start` from `Faulted`).
    pub fn retry(&mut self) {
        if self.state == TurnState::Faulted {
            self.start();
        } else {
            debug!(state = %self.state, "Nothing to retry");
        }
    }

    /// Mute or unmute the mic. Only honoured while listening on an open channel;
    /// returns the resulting mute flag.
    pub fn toggle_mute(&mut self) -> bool {
        if self.state != TurnState::Listening {
            debug!(state = %self.state, "Mute toggle ignored outside listening");
            return self.muted;
        }
        if self.transport.state() != ConnectionState::Open {
            debug!("Mute toggle ignored while channel is not open");
            return self.muted;
        }

        self.muted = !self.muted;
        self.gate.set_paused(self.muted);
        if let Some(capture) = self.capture.as_mut() {
            capture.speaking = false;
        }
        self.muted
    }

    /// Hang up from any state. Stops capture and playback and closes the channel;
    /// anything arriving afterwards is ignored.
    pub fn end_call(&mut self) {
        if self.state == TurnState::Ended {
            return;
        }
        info!(from = %self.state, "🛑 Ending call");

        self.close_gate();
        self.playback.stop();
        self.response_deadline = None;
        self.transport.close();
        self.set_state(TurnState::Ended);
        self.notify(HostNotice::CallEnded);
    }

    pub fn handle_event(&mut self, event: ConversationEvent) {
        if self.state == TurnState::Ended {
            debug!(?event, "Call ended, ignoring event");
            return;
        }

        match event {
            ConversationEvent::Capture(event) => self.on_capture(event),
            ConversationEvent::Transport(event) => self.on_transport(event),
            ConversationEvent::PlaybackFinished { playback_id } => {
                self.on_playback_finished(playback_id)
            }
            ConversationEvent::ResponseTimeout { turn } => self.on_response_timeout(turn),
        }
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::SpeechStart => {
                if self.state == TurnState::Listening {
                    if let Some(capture) = self.capture.as_mut() {
                        capture.speaking = true;
                    }
                }
            }
            CaptureEvent::SpeechCancelled => {
                debug!("Speech abandoned before an utterance formed");
                if let Some(capture) = self.capture.as_mut() {
                    capture.speaking = false;
                }
            }
            CaptureEvent::SpeechEnd(utterance) => self.on_utterance(utterance),
            CaptureEvent::Error(err) => {
                if self.state != TurnState::Listening {
                    debug!(error = %err, "Capture error after the mic closed, ignoring");
                    return;
                }
                error!(error = %err, "Microphone error");
                self.close_gate();
                self.capture = Some(CaptureSession::failed(&err));
                self.fault(err);
            }
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        if self.state != TurnState::Listening {
            debug!(state = %self.state, "Utterance outside listening, dropping");
            return;
        }
        if utterance.is_empty() {
            debug!("Empty utterance, keeping the mic open");
            return;
        }
        if self.muted {
            debug!("Utterance while muted, dropping");
            return;
        }

        self.set_state(TurnState::Transmitting);
        self.close_gate();

        let state = self.transport.state();
        if state != ConnectionState::Open {
            self.recover(VoiceError::Transport(format!("channel is {}", state)));
            return;
        }

        let samples = utterance.len();
        let captured_at = utterance.captured_at;
        if !self.transport.send(utterance.into_wire_bytes()) {
            self.recover(VoiceError::Transport("send rejected by channel".to_string()));
            return;
        }

        self.turn += 1;
        self.response_deadline = Some(Instant::now() + self.response_timeout);
        info!(
            turn = self.turn,
            samples,
            captured_at = %captured_at.format("%H:%M:%S%.3f"),
            "📤 Utterance sent, awaiting response"
        );
        self.set_state(TurnState::AwaitingResponse);
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(payload) => self.on_response(payload),
            TransportEvent::EmptyResponse => {
                if self.state == TurnState::AwaitingResponse {
                    info!(turn = self.turn, "Empty response, back to listening");
                    self.response_deadline = None;
                    self.listen();
                }
            }
            TransportEvent::StatusChanged(connection) => {
                debug!(%connection, "Channel status");
                let waiting = matches!(
                    self.state,
                    TurnState::Transmitting | TurnState::AwaitingResponse
                );
                if waiting && connection != ConnectionState::Open {
                    self.response_deadline = None;
                    self.recover(VoiceError::Transport(format!(
                        "connection {} while awaiting response",
                        connection.to_string().to_lowercase()
                    )));
                }
            }
            TransportEvent::Error(reason) => {
                if self.state == TurnState::AwaitingResponse {
                    self.response_deadline = None;
                    self.recover(VoiceError::Transport(reason));
                } else {
                    warn!(%reason, "Transport error");
                }
            }
            TransportEvent::Disconnected { attempts } => {
                self.close_gate();
                self.playback.stop();
                self.response_deadline = None;
                self.fault(VoiceError::ConnectionLost { attempts });
            }
        }
    }

    fn on_response(&mut self, payload: Bytes) {
        if self.state != TurnState::AwaitingResponse {
            warn!(
                state = %self.state,
                bytes = payload.len(),
                "Unexpected response audio, dropping"
            );
            return;
        }

        self.response_deadline = None;
        self.playback_id += 1;
        let playback_id = self.playback_id;
        let events = self.events.clone();
        let completion = PlaybackCompletion::new(move || {
            let _ = events.send(ConversationEvent::PlaybackFinished { playback_id });
        });

        info!(turn = self.turn, bytes = payload.len(), "🔊 Playing response");
        self.set_state(TurnState::Playing);
        self.playback.play(payload, completion);
    }

    fn on_playback_finished(&mut self, playback_id: u64) {
        if self.state != TurnState::Playing || playback_id != self.playback_id {
            debug!(playback_id, "Stale playback completion");
            return;
        }
        debug!(playback_id, "Playback finished");
        self.listen();
    }

    fn on_response_timeout(&mut self, turn: u64) {
        if self.state != TurnState::AwaitingResponse || turn != self.turn {
            debug!(turn, "Stale response timer");
            return;
        }
        self.response_deadline = None;
        self.recover(VoiceError::ResponseTimeout {
            secs: self.response_timeout.as_secs(),
        });
    }

    /// Open the mic and enter `Listening`. A failed open leaves the error visible in
    /// `Faulted`.
    fn listen(&mut self) {
        if self.playback.is_playing() {
            warn!("Playback still live while re-arming the mic, stopping it");
            self.playback.stop();
        }

        match self.gate.open() {
            Ok(()) => {
                self.muted = false;
                self.gate.set_paused(false);
                self.capture = Some(CaptureSession::opened());
                self.set_state(TurnState::Listening);
            }
            Err(err) => {
                error!(error = %err, "Could not open microphone");
                self.capture = Some(CaptureSession::failed(&err));
                self.fault(err);
            }
        }
    }

    fn close_gate(&mut self) {
        self.gate.close();
        self.muted = false;
        if let Some(capture) = self.capture.as_mut() {
            capture.active = false;
            capture.speaking = false;
        }
    }

    /// Recoverable error: show it and go back to listening.
    fn recover(&mut self, err: VoiceError) {
        warn!(error = %err, "Turn failed, returning to listening");
        self.last_error = Some(err.clone());
        self.notify(HostNotice::Error { error: err, fatal: false });
        self.listen();
    }

    fn fault(&mut self, err: VoiceError) {
        error!(error = %err, "Conversation faulted");
        let fatal = err.is_fatal();
        self.channel_lost |= err.requires_restart();
        self.last_error = Some(err.clone());
        self.notify(HostNotice::Error { error: err, fatal });
        self.set_state(TurnState::Faulted);
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        let from = self.state;
        self.state = next;
        debug!(%from, to = %next, "Turn state");
        self.notify(HostNotice::StateChanged { from, to: next });
    }

    fn notify(&self, notice: HostNotice) {
        if self.notices.send(notice).is_err() {
            debug!("No host listening for notices");
        }
    }
}
