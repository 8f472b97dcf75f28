//! Turn controller behaviour against in-memory components.

mod common;

use bytes::Bytes;
use common::{utterance, Harness};
use omni_voice::{
    CaptureEvent, ConnectionState, ConversationConfig, ConversationEvent, HostNotice,
    TransportEvent, TurnState, VoiceError,
};

use TurnState::*;

fn speech_end(h: &Harness, samples: usize) {
    h.events_tx
        .send(CaptureEvent::SpeechEnd(utterance(samples)).into())
        .unwrap();
}

fn inbound(h: &Harness, event: TransportEvent) {
    h.events_tx.send(event.into()).unwrap();
}

/// Start and send one utterance, leaving the controller in `AwaitingResponse`.
fn awaiting_response(h: &mut Harness) {
    h.controller.start();
    speech_end(h, 1000);
    h.pump();
    assert_eq!(h.controller.state(), AwaitingResponse);
}

#[tokio::test]
async fn utterance_is_sent_once_and_mic_closes() {
    let mut h = Harness::new();

    h.controller.start();
    assert_eq!(h.controller.state(), Listening);
    assert!(h.gate.record().open);

    speech_end(&h, 1000);
    h.pump();

    assert_eq!(
        h.transitions(),
        vec![
            (Idle, Listening),
            (Listening, Transmitting),
            (Transmitting, AwaitingResponse),
        ]
    );
    let sent = h.transport.record().sent.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0], utterance(1000).into_wire_bytes());
    assert_eq!(sent[0].len(), 4000);
    assert!(!h.gate.record().open);
    assert_eq!(h.controller.turn(), 1);
    assert!(h.controller.response_deadline().is_some());
}

#[tokio::test]
async fn full_turn_reopens_mic_after_playback() {
    let mut h = Harness::new();
    awaiting_response(&mut h);

    inbound(&h, TransportEvent::Message(Bytes::from_static(b"RIFF....WAVE")));
    h.pump();

    assert_eq!(h.controller.state(), Playing);
    assert_eq!(h.playback.record().played.len(), 1);
    assert!(!h.gate.record().open);
    assert!(h.controller.response_deadline().is_none());

    h.playback.finish();
    h.pump();

    assert_eq!(h.controller.state(), Listening);
    assert!(h.gate.record().open);
    assert_eq!(h.gate.record().opens, 2);
    assert!(h.controller.last_error().is_none());
}

#[tokio::test]
async fn empty_response_returns_to_listening_without_playback() {
    let mut h = Harness::new();
    awaiting_response(&mut h);
    h.transitions();

    inbound(&h, TransportEvent::EmptyResponse);
    h.pump();

    assert!(h.playback.record().played.is_empty());
    assert_eq!(h.controller.state(), Listening);
    assert_eq!(h.transitions(), vec![(AwaitingResponse, Listening)]);
    assert!(h.gate.record().open);
}

#[tokio::test]
async fn end_call_during_playback_stops_everything() {
    let mut h = Harness::new();
    awaiting_response(&mut h);
    inbound(&h, TransportEvent::Message(Bytes::from_static(b"audio")));
    h.pump();
    assert_eq!(h.controller.state(), Playing);

    h.controller.end_call();

    assert_eq!(h.controller.state(), Ended);
    assert!(!h.gate.record().open);
    assert!(h.playback.record().pending.is_none());
    assert!(h.playback.record().stops >= 1);
    assert!(h.transport.record().closed);

    // The stopped clip's completion and any late response are ignored
    inbound(&h, TransportEvent::Message(Bytes::from_static(b"late")));
    h.pump();
    assert_eq!(h.controller.state(), Ended);
    assert_eq!(h.playback.record().played.len(), 1);
    assert!(!h.gate.record().open);

    let mut ended = false;
    while let Ok(notice) = h.notices.try_recv() {
        ended |= notice == HostNotice::CallEnded;
    }
    assert!(ended);
}

#[tokio::test]
async fn exhausted_reconnects_fault_the_conversation() {
    let mut h = Harness::new();
    awaiting_response(&mut h);

    h.transport.record().state = ConnectionState::Closed;
    inbound(&h, TransportEvent::Disconnected { attempts: 5 });
    h.pump();

    assert_eq!(h.controller.state(), Faulted);
    assert!(!h.gate.record().open);
    assert_eq!(
        h.errors(),
        vec![(VoiceError::ConnectionLost { attempts: 5 }, true)]
    );
    assert_eq!(
        h.controller.last_error(),
        Some(&VoiceError::ConnectionLost { attempts: 5 })
    );
}

#[tokio::test]
async fn connection_drop_while_awaiting_recovers_then_faults_on_exhaustion() {
    let mut h = Harness::new();
    awaiting_response(&mut h);

    h.transport.record().state = ConnectionState::Closed;
    inbound(&h, TransportEvent::Error("stream ended".into()));
    inbound(&h, TransportEvent::StatusChanged(ConnectionState::Closed));
    h.pump();

    assert_eq!(h.controller.state(), Listening);
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0], (VoiceError::Transport("stream ended".into()), false));

    inbound(&h, TransportEvent::Disconnected { attempts: 5 });
    h.pump();
    assert_eq!(h.controller.state(), Faulted);
    assert!(!h.gate.record().open);
}

#[tokio::test]
async fn zero_length_utterance_never_reaches_transport() {
    let mut h = Harness::new();
    h.controller.start();

    speech_end(&h, 0);
    h.pump();

    assert!(h.transport.record().sent.is_empty());
    assert_eq!(h.controller.state(), Listening);
    assert!(h.gate.record().open);
}

#[tokio::test]
async fn send_on_closed_channel_is_a_visible_recoverable_error() {
    let mut h = Harness::new();
    h.controller.start();
    h.transport.record().state = ConnectionState::Connecting;

    speech_end(&h, 480);
    h.pump();

    assert_eq!(h.controller.state(), Listening);
    assert!(h.transport.record().sent.is_empty());
    assert!(h.gate.record().open);
    let errors = h.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], (VoiceError::Transport(_), false)));
}

#[tokio::test]
async fn rejected_send_returns_to_listening() {
    let mut h = Harness::new();
    h.controller.start();
    h.transport.record().reject_sends = true;

    speech_end(&h, 480);
    h.pump();

    assert_eq!(h.controller.state(), Listening);
    assert_eq!(h.controller.turn(), 0);
    assert!(h.controller.last_error().is_some());
}

#[tokio::test]
async fn mute_pauses_capture_and_drops_speech() {
    let mut h = Harness::new();
    h.controller.start();

    assert!(h.controller.toggle_mute());
    assert!(h.gate.record().paused);
    assert!(h.gate.record().open);

    speech_end(&h, 1000);
    h.pump();
    assert!(h.transport.record().sent.is_empty());
    assert_eq!(h.controller.state(), Listening);

    assert!(!h.controller.toggle_mute());
    assert!(!h.gate.record().paused);
}

#[tokio::test]
async fn mute_is_ignored_when_channel_not_open_or_not_listening() {
    let mut h = Harness::new();

    // Idle
    assert!(!h.controller.toggle_mute());

    h.controller.start();
    h.transport.record().state = ConnectionState::Connecting;
    assert!(!h.controller.toggle_mute());
    assert!(!h.gate.record().paused);
}

#[tokio::test]
async fn response_timeout_returns_to_listening() {
    let mut h = Harness::with_config(&ConversationConfig {
        response_timeout_secs: 12,
    });
    awaiting_response(&mut h);
    h.errors();

    let turn = h.controller.turn();
    h.controller
        .handle_event(ConversationEvent::ResponseTimeout { turn });

    assert_eq!(h.controller.state(), Listening);
    assert!(h.gate.record().open);
    assert_eq!(
        h.errors(),
        vec![(VoiceError::ResponseTimeout { secs: 12 }, false)]
    );
    assert!(h.controller.response_deadline().is_none());
}

#[tokio::test]
async fn stale_response_timeout_is_ignored() {
    let mut h = Harness::new();
    awaiting_response(&mut h);
    inbound(&h, TransportEvent::EmptyResponse);
    h.pump();

    // Second turn
    speech_end(&h, 800);
    h.pump();
    assert_eq!(h.controller.turn(), 2);

    h.controller
        .handle_event(ConversationEvent::ResponseTimeout { turn: 1 });

    assert_eq!(h.controller.state(), AwaitingResponse);
    assert!(h.controller.last_error().is_none());
}

#[tokio::test]
async fn response_outside_awaiting_is_not_played() {
    let mut h = Harness::new();
    h.controller.start();

    inbound(&h, TransportEvent::Message(Bytes::from_static(b"audio")));
    h.pump();

    assert!(h.playback.record().played.is_empty());
    assert_eq!(h.controller.state(), Listening);
}

#[tokio::test]
async fn mic_permission_failure_faults_and_retry_recovers() {
    let mut h = Harness::new();
    h.gate.record().fail_next_open = Some(VoiceError::PermissionDenied("blocked".into()));

    h.controller.start();

    assert_eq!(h.controller.state(), Faulted);
    let capture = h.controller.capture_session().cloned().unwrap();
    assert!(!capture.active);
    assert!(capture.error_state.unwrap().contains("blocked"));
    assert!(matches!(h.errors()[..], [(VoiceError::PermissionDenied(_), true)]));

    h.controller.retry();

    assert_eq!(h.controller.state(), Listening);
    assert!(h.gate.record().open);
    assert!(h.controller.last_error().is_none());
}

#[tokio::test]
async fn capture_failure_while_listening_faults() {
    let mut h = Harness::new();
    h.controller.start();

    h.events_tx
        .send(CaptureEvent::Error(VoiceError::CaptureFailed("stream died".into())).into())
        .unwrap();
    h.pump();

    assert_eq!(h.controller.state(), Faulted);
    assert!(!h.gate.record().open);
}

#[tokio::test]
async fn speech_start_marks_capture_session_speaking() {
    let mut h = Harness::new();
    h.controller.start();

    h.events_tx.send(CaptureEvent::SpeechStart.into()).unwrap();
    h.pump();

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.state, Listening);
    assert_eq!(snapshot.connection, ConnectionState::Open);
    assert!(snapshot.capture.unwrap().speaking);
    assert!(!snapshot.playing);
}

#[tokio::test]
async fn gate_and_playback_never_overlap_across_turns() {
    let mut h = Harness::new();
    h.controller.start();

    for turn in 1..=3u64 {
        speech_end(&h, 320 * turn as usize);
        h.pump();
        inbound(&h, TransportEvent::Message(Bytes::from(vec![1u8; 64])));
        h.pump();
        assert_eq!(h.controller.state(), Playing);
        h.playback.finish();
        h.pump();
        assert_eq!(h.controller.state(), Listening);
        assert_eq!(h.controller.turn(), turn);
    }

    assert_eq!(h.transport.record().sent.len(), 3);
    assert_eq!(h.playback.record().played.len(), 3);
}

#[tokio::test]
async fn retry_after_lost_channel_keeps_the_mic_off() {
    let mut h = Harness::new();
    awaiting_response(&mut h);

    h.transport.record().state = ConnectionState::Closed;
    inbound(&h, TransportEvent::Disconnected { attempts: 5 });
    h.pump();
    assert_eq!(h.controller.state(), Faulted);
    assert!(h.controller.channel_lost());

    h.controller.retry();
    h.controller.start();

    assert_eq!(h.controller.state(), Faulted);
    assert!(!h.gate.record().open);
    assert_eq!(h.gate.record().opens, 1);
    assert_eq!(
        h.controller.last_error(),
        Some(&VoiceError::ConnectionLost { attempts: 5 })
    );
}

#[tokio::test]
async fn backend_down_before_start_blocks_start() {
    let mut h = Harness::new();
    h.transport.record().state = ConnectionState::Closed;

    inbound(&h, TransportEvent::Disconnected { attempts: 5 });
    h.pump();
    assert_eq!(h.controller.state(), Faulted);

    h.controller.retry();

    assert_eq!(h.controller.state(), Faulted);
    assert!(!h.gate.record().open);
    assert_eq!(h.gate.record().opens, 0);
}

#[tokio::test]
async fn misfire_clears_speaking() {
    let mut h = Harness::new();
    h.controller.start();

    h.events_tx.send(CaptureEvent::SpeechStart.into()).unwrap();
    h.pump();
    assert!(h.controller.snapshot().capture.unwrap().speaking);

    h.events_tx.send(CaptureEvent::SpeechCancelled.into()).unwrap();
    h.pump();

    let snapshot = h.controller.snapshot();
    assert!(!snapshot.capture.as_ref().unwrap().speaking);
    assert_eq!(snapshot.state, Listening);
    assert!(h.gate.record().open);
    assert!(snapshot.to_string().contains("Speaking: No"));
}
