use std::time::Duration;

use super::*;
use crate::init::InitGate;
use crate::memory::MemoryTransport;

use tether_wire::EnvelopeCodec;

/// A session that queues outbound frames but never drives a transport.
/// Good enough to bind extensions for unit tests.
fn idle_session() -> Session {
    let (near, _far) = MemoryTransport::pair();
    Session::new(near, SessionOptions::default())
}

fn raw_frame(payload: &[u8], oneway: bool) -> Vec<u8> {
    let codec = EnvelopeCodec::new(Schema::new());
    codec.encode_message(&[0x5Au8; 32], &Payload::Bytes(payload.to_vec()), oneway)
}

#[tokio::test]
async fn call_on_unbound_extension_fails_synchronously() {
    let ext = Extension::builder("orphan").build();
    let err = ext.call(&b"ping"[..]).await.unwrap_err();
    assert!(err.is(codes::ERR_CLOSE));
    let err = ext.send(&b"ping"[..]).await.unwrap_err();
    assert!(err.is(codes::ERR_CLOSE));
}

#[tokio::test]
async fn double_open_fails_with_already_open() {
    let session = idle_session();
    let ext = Extension::builder("once").build();
    assert_eq!(ext.state(), ExtensionState::New);
    ext.open(session.clone()).unwrap();
    assert_eq!(ext.state(), ExtensionState::Open);

    let err = ext.open(session).unwrap_err();
    assert!(err.is(codes::ERR_ALREADY_OPEN));
}

#[tokio::test]
async fn unregistered_type_url_is_an_invalid_argument() {
    let session = idle_session();
    let ext = Extension::builder("typed")
        .schema(Schema::new().with_type("example.Known"))
        .build();
    ext.open(session).unwrap();

    let err = ext
        .send(Payload::Typed {
            type_url: "example.Unknown".to_owned(),
            value: vec![1],
        })
        .await
        .unwrap_err();
    assert!(err.is(codes::ERR_INVALID_ARGUMENT));

    // Raw bytes stay fine in structured mode.
    ext.send(&b"raw"[..]).await.unwrap();
}

#[tokio::test]
async fn close_rejects_pending_calls_and_empties_the_table() {
    let session = idle_session();
    let ext = Extension::builder("pending")
        .timeout(Duration::from_secs(30))
        .build();
    ext.open(session).unwrap();

    let caller = ext.clone();
    let call = tokio::spawn(async move { caller.call(&b"stuck"[..]).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ext.pending_calls(), 1);

    ext.close(None).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is(codes::ERR_CLOSE));
    assert_eq!(ext.pending_calls(), 0);
    assert_eq!(ext.state(), ExtensionState::Closed);

    // Further sends fail without touching the wire.
    let err = ext.call(&b"late"[..]).await.unwrap_err();
    assert!(err.is(codes::ERR_CLOSE));
}

#[tokio::test]
async fn close_reason_propagates_to_pending_calls() {
    let session = idle_session();
    let ext = Extension::builder("doomed")
        .timeout(Duration::from_secs(30))
        .build();
    ext.open(session).unwrap();

    let caller = ext.clone();
    let call = tokio::spawn(async move { caller.call(&b"stuck"[..]).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    ext.close(Some(ProtocolError::connection_invalid("vetoed"))).await;
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is(codes::ERR_PROTOCOL_CONNECTION_INVALID));
}

#[tokio::test]
async fn incoming_request_without_handler_is_reported_and_dropped() {
    let session = idle_session();
    let mut events = session.subscribe();
    let ext = Extension::builder("mute").build();
    ext.open(session).unwrap();

    ext.handle_frame(raw_frame(b"anyone there?", false)).await;

    assert_eq!(ext.stats().error, 1);
    match events.recv().await.unwrap() {
        SessionEvent::Error(err) => assert!(err.is(codes::ERR_NO_HANDLER)),
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[tokio::test]
async fn unparseable_frame_is_dropped_without_dispatch() {
    let session = idle_session();
    let ext = Extension::builder("garbled")
        .on_message(|_session, _payload, _options| async move {
            panic!("handler must not run for garbage frames");
        })
        .build();
    ext.open(session).unwrap();

    ext.handle_frame(vec![0xFF, 0xFF, 0x00]).await;
    assert_eq!(ext.stats().error, 1);
    assert_eq!(ext.stats().receive, 0);
}

#[tokio::test]
async fn oneway_frames_never_produce_a_response() {
    let session = idle_session();
    let ext = Extension::builder("silent")
        .on_message(|_session, _payload, _options| async move {
            Err(ProtocolError::system("kaboom"))
        })
        .build();
    ext.open(session).unwrap();

    let sent_before = ext.stats().send;
    ext.handle_frame(raw_frame(b"fire", true)).await;
    // The handler failed, but one-way means no error response either.
    assert_eq!(ext.stats().send, sent_before);
    assert_eq!(ext.stats().error, 1);
}

#[tokio::test]
async fn stats_count_sends() {
    let session = idle_session();
    let ext = Extension::builder("counted").build();
    ext.open(session).unwrap();

    ext.send(&b"one"[..]).await.unwrap();
    ext.send(&b"two"[..]).await.unwrap();
    let stats = ext.stats();
    assert_eq!(stats.send, 2);
    assert_eq!(stats.receive, 0);
}

// ============================================================================
// Init gate
// ============================================================================

fn init_frame(token: &[u8]) -> Vec<u8> {
    raw_frame(token, true)
}

#[tokio::test]
async fn init_gate_confirms_after_remote_valid() {
    let session = idle_session();
    let gate = InitGate::new();
    gate.extension().open(session).unwrap();

    gate.extension().handle_frame(init_frame(b"valid")).await;
    let valid = gate.confirm(Duration::from_millis(200)).await.unwrap();
    assert!(valid);
}

#[tokio::test]
async fn init_gate_rejects_after_remote_invalid() {
    let session = idle_session();
    let gate = InitGate::new();
    gate.extension().open(session).unwrap();

    gate.extension().handle_frame(init_frame(b"invalid")).await;
    let valid = gate.confirm(Duration::from_millis(200)).await.unwrap();
    assert!(!valid);
}

#[tokio::test]
async fn init_gate_times_out_to_invalid() {
    let session = idle_session();
    let gate = InitGate::new();
    gate.extension().open(session).unwrap();

    let valid = gate.confirm(Duration::from_millis(50)).await.unwrap();
    assert!(!valid);
}

#[tokio::test]
async fn init_gate_ignores_unknown_tokens() {
    let session = idle_session();
    let gate = InitGate::new();
    gate.extension().open(session).unwrap();

    gate.extension().handle_frame(init_frame(b"gibberish")).await;
    let valid = gate.confirm(Duration::from_millis(50)).await.unwrap();
    assert!(!valid);
}

#[tokio::test]
async fn init_gate_close_resolves_waiters_to_invalid() {
    let session = idle_session();
    let gate = std::sync::Arc::new(InitGate::new());
    gate.extension().open(session).unwrap();

    let waiter = gate.clone();
    let confirm = tokio::spawn(async move { waiter.confirm(Duration::from_secs(30)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.extension().close(None).await;
    let valid = confirm.await.unwrap().unwrap();
    assert!(!valid);
}

#[tokio::test]
async fn remote_destroy_closes_the_session_as_invalid() {
    let session = idle_session();
    let gate = InitGate::new();
    gate.extension().open(session.clone()).unwrap();

    gate.extension().handle_frame(init_frame(b"destroy")).await;

    let reason = session.closed().await.expect("close reason");
    assert!(reason.is(codes::ERR_PROTOCOL_CONNECTION_INVALID));
    assert_eq!(session.state(), SessionState::Closed);
}
