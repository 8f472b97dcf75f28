//! The single event queue feeding the turn controller.
//!
//! Capture threads, the socket task, playback threads and the response timer all push
//! into one unbounded channel; only the session loop drains it.

use crate::capture::CaptureEvent;
use crate::transport::TransportEvent;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum ConversationEvent {
    Capture(CaptureEvent),
    Transport(TransportEvent),
    /// A playback started by the controller has ended (played, failed or stopped)
    PlaybackFinished { playback_id: u64 },
    /// The response wait for `turn` expired
    ResponseTimeout { turn: u64 },
}

impl From<CaptureEvent> for ConversationEvent {
    fn from(event: CaptureEvent) -> Self {
        ConversationEvent::Capture(event)
    }
}

impl From<TransportEvent> for ConversationEvent {
    fn from(event: TransportEvent) -> Self {
        ConversationEvent::Transport(event)
    }
}

pub type EventSender = mpsc::UnboundedSender<ConversationEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ConversationEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Run a short blocking section (thread handshake or join) from code that may be on a
/// tokio worker. On the multi-threaded runtime the worker's other tasks are moved off
/// first; elsewhere `f` just runs inline.
pub(crate) fn blocking_section<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_section_outside_runtime() {
        assert_eq!(blocking_section(|| 7), 7);
    }

    #[tokio::test]
    async fn blocking_section_on_current_thread_runtime() {
        assert_eq!(blocking_section(|| "inline"), "inline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_section_on_worker_thread() {
        let joined = blocking_section(|| {
            std::thread::spawn(|| 40 + 2).join().unwrap()
        });
        assert_eq!(joined, 42);
    }
}
