//! Duplex WebSocket channel to the conversation backend.
//!
//! One binary message out per utterance, one binary message back per response. The
//! connection task reconnects on unexpected closure according to a `ReconnectPolicy`
//! and reports `Disconnected` once the attempts are exhausted. Callers see a single
//! handle for the whole session regardless of how many sockets sit behind it.

use crate::config::ReconnectPolicy;
use crate::event::{ConversationEvent, EventSender};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Open",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(label)
    }
}

/// Events emitted by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StatusChanged(ConnectionState),
    /// A non-empty inbound binary frame
    Message(Bytes),
    /// A zero-length inbound binary frame; never handed out as audio
    EmptyResponse,
    /// The socket failed; a reconnect may follow
    Error(String),
    /// Reconnect attempts exhausted; the channel stays closed
    Disconnected { attempts: u32 },
}

/// Binary duplex channel used by the turn controller.
pub trait TransportChannel: Send {
    /// Enqueue one outbound frame. Returns false (after logging a warning) when the
    /// channel is not open; this is never an error for the caller.
    fn send(&self, payload: Bytes) -> bool;

    fn state(&self) -> ConnectionState;

    /// Close for good; no reconnect follows.
    fn close(&self);
}

enum Outbound {
    Frame(Bytes),
    Close,
}

enum PumpExit {
    Requested,
    Lost(String),
}

/// tokio-tungstenite implementation of `TransportChannel`.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    /// Start connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(url: impl Into<String>, policy: ReconnectPolicy, events: EventSender) -> Self {
        let url = url.into();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let link = Link {
            url,
            policy,
            events,
            state: state_tx,
        };
        let task = tokio::spawn(link.run(outbound_rx));

        Self {
            outbound: outbound_tx,
            state: state_rx,
            task: Some(task),
        }
    }

    /// Watch connection state changes (e.g. for a status line).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close and wait for the connection task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.outbound.send(Outbound::Close);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Transport task failed: {}", e);
            }
        }
    }
}

impl TransportChannel for WsTransport {
    fn send(&self, payload: Bytes) -> bool {
        let state = *self.state.borrow();
        if state != ConnectionState::Open {
            warn!(%state, bytes = payload.len(), "Channel not open, dropping outbound frame");
            return false;
        }
        debug!(bytes = payload.len(), "Queueing outbound frame");
        self.outbound.send(Outbound::Frame(payload)).is_ok()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// State owned by the connection task.
struct Link {
    url: String,
    policy: ReconnectPolicy,
    events: EventSender,
    state: watch::Sender<ConnectionState>,
}

impl Link {
    async fn run(self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let mut attempts = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);
            info!(url = %self.url, attempt = attempts, "🔌 Connecting to conversation endpoint");

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    attempts = 0;
                    self.set_state(ConnectionState::Open);
                    info!("✅ Conversation channel open");

                    match self.pump(ws, &mut outbound).await {
                        PumpExit::Requested => {
                            self.set_state(ConnectionState::Closed);
                            info!("⏹️ Conversation channel closed");
                            return;
                        }
                        PumpExit::Lost(reason) => {
                            warn!(%reason, "Conversation channel lost");
                            self.emit(TransportEvent::Error(reason));
                            if drain_stale(&mut outbound) {
                                self.set_state(ConnectionState::Closed);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                }
            }

            self.set_state(ConnectionState::Closed);

            if attempts >= self.policy.max_attempts {
                error!(attempts, "Reconnect attempts exhausted");
                self.emit(TransportEvent::Disconnected { attempts });
                return;
            }
            attempts += 1;

            // Wait out the interval, but honour a close request in the meantime
            let wait = tokio::time::sleep(self.policy.interval);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    request = outbound.recv() => match request {
                        Some(Outbound::Frame(frame)) => {
                            warn!(bytes = frame.len(), "Channel reconnecting, dropping outbound frame");
                        }
                        Some(Outbound::Close) | None => {
                            info!("Close requested while reconnecting");
                            return;
                        }
                    },
                }
            }
        }
    }

    async fn pump(&self, ws: WsStream, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> PumpExit {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                request = outbound.recv() => match request {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                            return PumpExit::Lost(format!("send failed: {}", e));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        self.set_state(ConnectionState::Closing);
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not sent: {}", e);
                        }
                        let _ = sink.close().await;
                        return PumpExit::Requested;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        if data.is_empty() {
                            warn!("Received empty audio frame, skipping playback");
                            self.emit(TransportEvent::EmptyResponse);
                        } else {
                            debug!(bytes = data.len(), "Received audio frame");
                            self.emit(TransportEvent::Message(Bytes::from(data)));
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        warn!(len = text.len(), "Received text frame, not a playable audio payload");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return PumpExit::Lost(match frame {
                            Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                            None => "closed by server".to_string(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    None => return PumpExit::Lost("stream ended".to_string()),
                },
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "Connection state changed");
            self.emit(TransportEvent::StatusChanged(next));
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(ConversationEvent::Transport(event)).is_err() {
            debug!("Conversation queue closed, dropping transport event");
        }
    }
}

/// Frames queued against a socket that just died would otherwise go out on the next one.
/// Returns true if a close request was among them.
fn drain_stale(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    let mut dropped = 0usize;
    let mut close_requested = false;
    while let Ok(request) = outbound.try_recv() {
        match request {
            Outbound::Frame(_) => dropped += 1,
            Outbound::Close => close_requested = true,
        }
    }
    if dropped > 0 {
        warn!(dropped, "Dropped frames queued on a lost connection");
    }
    close_requested
}
