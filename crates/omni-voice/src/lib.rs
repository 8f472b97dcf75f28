//! # Omni Voice - Half-Duplex Voice Conversation Client
//!
//! Hands-free, turn-taking voice calls against a conversation backend: the microphone
//! is listened to until the user stops speaking, the utterance is shipped over a
//! WebSocket, the spoken reply is played back, and the microphone is re-armed.
//! Capture and playback are never active at the same time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    Conversation Session                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐     │
//! │  │   Mic In     │→ │  WebRTC VAD  │→ │   Segmenter      │     │
//! │  │   (cpal)     │  │              │  │   (800ms hold)   │     │
//! │  └──────────────┘  └──────────────┘  └────────┬─────────┘     │
//! │                                               ↓ utterance     │
//! │  ┌──────────────┐   response audio   ┌──────────────────┐     │
//! │  │  Audio Out   │←───────────────────│  Turn Controller │     │
//! │  │   (rodio)    │                    │                  │     │
//! │  └──────────────┘                    └────────┬─────────┘     │
//! │                                               ↕ binary frames │
//! │                                      ┌──────────────────┐     │
//! │                                      │ WebSocket (tokio │     │
//! │                                      │   -tungstenite)  │     │
//! │                                      └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod playback;
pub mod segment;
pub mod session;
pub mod transport;
pub mod vad;

pub use capture::{
    AudioCaptureGate, CaptureEmitter, CaptureEvent, CaptureSession, FrameProcessor, MicrophoneGate,
    Utterance,
};
pub use config::{CaptureConfig, ConversationConfig, ReconnectPolicy, TransportConfig, VoiceConfig};
pub use controller::{ConversationSnapshot, HostNotice, TurnController, TurnState};
pub use error::{VoiceError, VoiceResult};
pub use event::{event_channel, ConversationEvent, EventReceiver, EventSender};
pub use playback::{PlaybackCompletion, PlaybackSink, RodioPlayback};
pub use segment::{SegmentEvent, UtteranceSegmenter};
pub use session::{open_conversation, Conversation, ConversationSession, HostCommand, SessionHandle};
pub use transport::{ConnectionState, TransportChannel, TransportEvent, WsTransport};
pub use vad::VadDetector;
