//! Conversation event loop.
//!
//! `ConversationSession` owns the `TurnController` and is the only place its methods are
//! called from. It drains the conversation queue, arms the response timer and applies
//! host commands sent through a cloneable `SessionHandle`.

use crate::capture::MicrophoneGate;
use crate::config::VoiceConfig;
use crate::controller::{ConversationSnapshot, HostNotice, TurnController, TurnState};
use crate::error::VoiceResult;
use crate::event::{event_channel, ConversationEvent, EventReceiver};
use crate::playback::RodioPlayback;
use crate::transport::{ConnectionState, WsTransport};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Commands from the host UI
#[derive(Debug)]
pub enum HostCommand {
    Start,
    ToggleMute,
    Retry,
    EndCall,
    Snapshot(oneshot::Sender<ConversationSnapshot>),
}

/// Cheap handle for driving a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl SessionHandle {
    /// Returns false once the session loop has exited.
    pub fn start(&self) -> bool {
        self.send(HostCommand::Start)
    }

    pub fn toggle_mute(&self) -> bool {
        self.send(HostCommand::ToggleMute)
    }

    pub fn retry(&self) -> bool {
        self.send(HostCommand::Retry)
    }

    pub fn end_call(&self) -> bool {
        self.send(HostCommand::EndCall)
    }

    /// Current snapshot, or `None` if the session has finished.
    pub async fn snapshot(&self) -> Option<ConversationSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(HostCommand::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    fn send(&self, command: HostCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

pub struct ConversationSession {
    controller: TurnController,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<HostCommand>,
}

impl ConversationSession {
    /// `events` must be the receiving end of the queue the controller's components
    /// were built with.
    pub fn new(controller: TurnController, events: EventReceiver) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            controller,
            events,
            commands: rx,
        };
        (session, SessionHandle { commands: tx })
    }

    /// Run until the call ends. Dropping every `SessionHandle` also ends the call.
    pub async fn run(mut self) -> ConversationSnapshot {
        info!("🎭 Conversation session running");

        while self.controller.state() != TurnState::Ended {
            let deadline = self.controller.response_deadline();
            let turn = self.controller.turn();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        debug!("All session handles dropped");
                        self.controller.end_call();
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.controller.handle_event(event),
                    None => {
                        debug!("Conversation queue closed");
                        self.controller.end_call();
                    }
                },
                _ = response_timer(deadline) => {
                    self.controller.handle_event(ConversationEvent::ResponseTimeout { turn });
                }
            }
        }

        info!(turns = self.controller.turn(), "✅ Conversation session finished");
        self.controller.snapshot()
    }

    fn apply(&mut self, command: HostCommand) {
        match command {
            HostCommand::Start => self.controller.start(),
            HostCommand::ToggleMute => {
                let muted = self.controller.toggle_mute();
                info!(muted, "Mute toggled");
            }
            HostCommand::Retry => self.controller.retry(),
            HostCommand::EndCall => self.controller.end_call(),
            HostCommand::Snapshot(reply) => {
                let _ = reply.send(self.controller.snapshot());
            }
        }
    }
}

async fn response_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A session wired to real hardware and the configured endpoint.
pub struct Conversation {
    pub session: ConversationSession,
    pub handle: SessionHandle,
    pub notices: mpsc::UnboundedReceiver<HostNotice>,
    pub connection: watch::Receiver<ConnectionState>,
}

/// Build a conversation from config: microphone gate, WebSocket transport (connecting
/// immediately) and rodio playback. Must be called inside a tokio runtime.
pub fn open_conversation(config: &VoiceConfig) -> VoiceResult<Conversation> {
    let (events_tx, events_rx) = event_channel();

    let gate = MicrophoneGate::new(config.capture.clone(), events_tx.clone())?;
    let transport = WsTransport::connect(
        config.transport.url.clone(),
        config.transport.reconnect_policy(),
        events_tx.clone(),
    );
    let connection = transport.subscribe();
    let playback = RodioPlayback::new();

    let (controller, notices) = TurnController::new(
        &config.conversation,
        Box::new(gate),
        Box::new(transport),
        Box::new(playback),
        events_tx,
    );
    let (session, handle) = ConversationSession::new(controller, events_rx);

    info!(url = %config.transport.url, "Conversation wired");

    Ok(Conversation {
        session,
        handle,
        notices,
        connection,
    })
}
