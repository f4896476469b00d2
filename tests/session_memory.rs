//! Session behaviour driven through the in-memory transport, with the test
//! playing the broker on the `MemoryPeer` side.

use bytes::Bytes;
use corvid_stomp::{
    AckMode, Command, ConnectOptions, Expectation, Frame, Heartbeat, MemoryPeer, MemoryTransport,
    OperationState, Session, SessionConfig, SessionEvent, SessionState, StompError,
    SubscriptionOptions,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

async fn open() -> (Session, MemoryPeer) {
    let (transport, peer) = MemoryTransport::pair();
    let session = Session::open(transport, SessionConfig::default())
        .await
        .expect("open");
    (session, peer)
}

/// Open a session and complete the handshake with the given heart-beats.
async fn connected_with(local: Option<Heartbeat>, broker: Option<Heartbeat>) -> (Session, MemoryPeer) {
    let (session, mut peer) = open().await;
    let mut options = ConnectOptions::new().host("broker");
    if let Some(hb) = local {
        options = options.heartbeat(hb);
    }
    let op = session.connect(&options).await.expect("connect");
    let connect = peer.recv_frame().await.expect("CONNECT");
    assert_eq!(connect.command, Command::Connect);
    assert!(peer.send_frame(Frame::connected("1.2", broker)));
    op.wait().await.expect("CONNECTED");
    (session, peer)
}

async fn connected() -> (Session, MemoryPeer) {
    connected_with(None, None).await
}

async fn next_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed");
        if pred(&ev) {
            return ev;
        }
    }
}

async fn wait_for_state(session: &Session, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state().await != state {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("timed out waiting for session state");
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn connect_sends_exact_bytes_and_becomes_connected() {
    let (session, mut peer) = open().await;
    assert_eq!(session.state().await, SessionState::Disconnected);

    let options = ConnectOptions::new().host("broker").login("u").passcode("p");
    let op = session.connect(&options).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connecting);

    let bytes = peer.recv().await.unwrap();
    assert_eq!(
        &bytes[..],
        b"CONNECT\naccept-version:1.2\nhost:broker\nlogin:u\npasscode:p\n\n\0"
    );

    peer.send_bytes(Bytes::from_static(b"CONNECTED\nversion:1.2\n\n\0"));
    let frame = op.wait().await.unwrap().expect("CONNECTED frame");
    assert_eq!(frame.command, Command::Connected);
    assert_eq!(frame.get_header("version"), Some("1.2"));
    assert_eq!(session.state().await, SessionState::Connected);
}

#[tokio::test]
async fn error_during_handshake_fails_connect() {
    let (session, mut peer) = open().await;
    let mut events = session.events();
    let op = session.connect(&ConnectOptions::new()).await.unwrap();
    peer.recv().await.unwrap();
    peer.send_frame(Frame::error("Authentication failed", Some("Invalid credentials")));

    match op.wait().await {
        Err(StompError::Broker(e)) => {
            assert_eq!(e.message, "Authentication failed");
            assert_eq!(e.body.as_deref(), Some("Invalid credentials"));
        }
        other => panic!("expected broker error, got {:?}", other),
    }
    next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(Some(_)))).await;
    assert_eq!(session.state().await, SessionState::Disconnected);
}

#[tokio::test]
async fn malformed_bytes_during_handshake_fail_connect() {
    let (session, mut peer) = open().await;
    let op = session.connect(&ConnectOptions::new()).await.unwrap();
    peer.recv().await.unwrap();
    peer.send_bytes(Bytes::from_static(b"CONNECTED\nbroken header\n\n\0"));
    assert!(matches!(op.wait().await, Err(StompError::MalformedFrame(_))));
}

#[tokio::test]
async fn frames_before_connect_are_refused() {
    let (session, mut peer) = open().await;
    let err = session.send("/queue/a", b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, StompError::ProtocolViolation(_)));
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn second_connect_is_refused() {
    let (session, _peer) = connected().await;
    let err = session.connect(&ConnectOptions::new()).await.unwrap_err();
    assert!(matches!(err, StompError::ProtocolViolation(_)));
}

#[tokio::test]
async fn opened_event_is_broadcast_after_open() {
    let (session, _peer) = open().await;
    let mut events = session.events();
    assert_eq!(next_event(&mut events, |_| true).await, SessionEvent::Opened);
    assert_eq!(session.state().await, SessionState::Disconnected);
}

#[tokio::test]
async fn cancelled_connect_before_write_returns_to_disconnected() {
    let (session, mut peer) = open().await;
    let op = session.connect(&ConnectOptions::new()).await.unwrap();
    assert_eq!(session.state().await, SessionState::Connecting);
    assert!(op.cancel().await);
    wait_for_state(&session, SessionState::Disconnected).await;
    assert!(peer.try_recv().is_none());

    let op = session.connect(&ConnectOptions::new()).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Connect);
    peer.send_frame(Frame::connected("1.2", None));
    op.wait().await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn subscribe_routes_message_to_handler() {
    let (session, mut peer) = connected().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (id, _) = session
        .subscribe("/topic/news", SubscriptionOptions::default(), move |frame| {
            let _ = tx.send(frame);
        })
        .await
        .unwrap();
    assert_eq!(id, "sub-0");

    let sub = peer.recv_frame().await.unwrap();
    assert_eq!(sub.command, Command::Subscribe);
    assert_eq!(sub.get_header("id"), Some("sub-0"));
    assert_eq!(sub.get_header("destination"), Some("/topic/news"));
    assert_eq!(sub.get_header("ack"), Some("auto"));

    peer.send_bytes(Bytes::from_static(
        b"MESSAGE\ndestination:/topic/news\nsubscription:sub-0\nmessage-id:1\ncontent-length:5\n\nhello\0",
    ));
    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.body, b"hello");
    assert_eq!(msg.get_header("message-id"), Some("1"));
}

#[tokio::test]
async fn subscription_ids_increase() {
    let (session, _peer) = connected().await;
    let (a, _) = session
        .subscribe("/topic/a", SubscriptionOptions::default(), |_| {})
        .await
        .unwrap();
    let (b, _) = session
        .subscribe("/topic/b", SubscriptionOptions::default(), |_| {})
        .await
        .unwrap();
    assert_eq!((a.as_str(), b.as_str()), ("sub-0", "sub-1"));
}

#[tokio::test]
async fn unknown_subscription_is_reported_unrouted() {
    let (session, peer) = connected().await;
    let mut events = session.events();
    peer.send_frame(Frame::message("/topic/x", "sub-9", "7", None, b"lost".to_vec()));

    match next_event(&mut events, |e| matches!(e, SessionEvent::Unrouted(_))).await {
        SessionEvent::Unrouted(f) => assert_eq!(f.get_header("subscription"), Some("sub-9")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(session.state().await, SessionState::Connected);
}

#[tokio::test]
async fn channel_subscription_ack_and_unsubscribe() {
    let (session, mut peer) = connected().await;
    let mut events = session.events();
    let options = SubscriptionOptions::default().ack(AckMode::ClientIndividual);
    let mut sub = session.subscribe_channel("/queue/work", options).await.unwrap();
    assert_eq!(sub.id(), "sub-0");
    assert_eq!(sub.destination(), "/queue/work");

    let frame = peer.recv_frame().await.unwrap();
    assert_eq!(frame.get_header("ack"), Some("client-individual"));

    peer.send_frame(
        Frame::message("/queue/work", "sub-0", "m-1", None, b"job".to_vec()).header("ack", "a-1"),
    );
    let msg = sub.recv().await.unwrap();
    assert_eq!(msg.body, b"job");

    sub.ack(&msg).await.unwrap();
    let ack = peer.recv_frame().await.unwrap();
    assert_eq!(ack.command, Command::Ack);
    assert_eq!(ack.get_header("id"), Some("a-1"));

    sub.nack(&msg).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Nack);

    let mut receiver = sub.into_receiver();
    session.unsubscribe("sub-0").await.unwrap().wait().await.unwrap();
    let unsub = peer.recv_frame().await.unwrap();
    assert_eq!(unsub.command, Command::Unsubscribe);
    assert_eq!(unsub.get_header("id"), Some("sub-0"));
    assert_eq!(receiver.recv().await, None);

    peer.send_frame(Frame::message("/queue/work", "sub-0", "m-2", None, b"late".to_vec()));
    next_event(&mut events, |e| matches!(e, SessionEvent::Unrouted(_))).await;
}

#[tokio::test]
async fn unsubscribe_unknown_id_is_refused() {
    let (session, _peer) = connected().await;
    assert!(matches!(
        session.unsubscribe("sub-42").await,
        Err(StompError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn durable_queue_replaces_destination() {
    let (session, mut peer) = connected().await;
    let options = SubscriptionOptions {
        durable_queue: Some("/queue/durable-events".to_string()),
        ..Default::default()
    }
    .header("x-queue-name", "events");
    session
        .subscribe("/topic/events", options, |_| {})
        .await
        .unwrap();
    let frame = peer.recv_frame().await.unwrap();
    assert_eq!(frame.get_header("destination"), Some("/queue/durable-events"));
    assert_eq!(frame.get_header("x-queue-name"), Some("events"));
}

// ============================================================================
// Receipts and correlation
// ============================================================================

#[tokio::test]
async fn receipt_completes_operation() {
    let (session, mut peer) = connected().await;
    let op = session
        .send_operation(
            Frame::send("/queue/a", None, b"x".to_vec()),
            Expectation::Receipt(None),
        )
        .await
        .unwrap();
    let receipt = op.receipt_id().unwrap().to_string();
    assert_eq!(receipt, "rcpt-0");

    let sent = peer.recv_frame().await.unwrap();
    assert_eq!(sent.get_header("receipt"), Some(receipt.as_str()));
    peer.send_frame(Frame::receipt_frame(&receipt));

    let frame = op.wait().await.unwrap().unwrap();
    assert_eq!(frame.get_header("receipt-id"), Some("rcpt-0"));
    assert_eq!(session.pending_operations().await, 0);
}

#[tokio::test]
async fn send_frame_with_receipt_header_waits_for_it() {
    let (session, mut peer) = connected().await;
    let op = session
        .send_frame(Frame::begin("tx1").receipt("begin-1"))
        .await
        .unwrap();
    assert_eq!(op.receipt_id(), Some("begin-1"));
    peer.recv_frame().await.unwrap();
    assert_eq!(op.state(), OperationState::Executing);
    peer.send_frame(Frame::receipt_frame("begin-1"));
    assert!(op.wait().await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_receipt_is_rejected_before_sending() {
    let (session, mut peer) = connected().await;
    let first = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(Some("dup".into())))
        .await
        .unwrap();
    let second = session
        .send_operation(Frame::commit("tx"), Expectation::Receipt(Some("dup".into())))
        .await;
    assert!(matches!(second, Err(StompError::ProtocolViolation(_))));

    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Begin);
    session.send("/queue/marker", b"m".to_vec()).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Send);

    peer.send_frame(Frame::receipt_frame("dup"));
    assert!(first.wait().await.is_ok());
}

#[tokio::test]
async fn cancelled_operation_ignores_late_receipt() {
    let (session, mut peer) = connected().await;
    let op = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(Some("c1".into())))
        .await
        .unwrap();
    peer.recv_frame().await.unwrap();

    assert!(op.cancel().await);
    assert_eq!(op.state(), OperationState::Cancelled);
    assert_eq!(session.pending_operations().await, 0);

    peer.send_frame(Frame::receipt_frame("c1"));
    assert_eq!(op.wait().await, Err(StompError::Cancelled));
    assert_eq!(session.state().await, SessionState::Connected);
}

#[tokio::test]
async fn operation_cancelled_before_write_is_never_sent() {
    let (session, mut peer) = connected().await;
    let op = session
        .send_operation(Frame::begin("tx-cancelled"), Expectation::Receipt(Some("pc".into())))
        .await
        .unwrap();
    assert_eq!(op.state(), OperationState::Ready);
    assert!(op.cancel().await);

    session.send("/queue/marker", b"m".to_vec()).await.unwrap();
    let first = peer.recv_frame().await.unwrap();
    assert_eq!(first.command, Command::Send);
    assert_eq!(first.get_header("destination"), Some("/queue/marker"));
    assert_eq!(op.state(), OperationState::Cancelled);
    assert_eq!(op.wait().await, Err(StompError::Cancelled));
    assert_eq!(session.pending_operations().await, 0);
}

#[tokio::test]
async fn prepared_operation_waits_for_start() {
    let (session, mut peer) = connected().await;
    let mut op = session
        .prepare_operation(Frame::begin("tx"), Expectation::Receipt(Some("go".into())))
        .await
        .unwrap();
    assert!(op.is_prepared());
    assert_eq!(op.state(), OperationState::Ready);
    assert_eq!(op.receipt_id(), Some("go"));
    tokio::task::yield_now().await;
    assert!(peer.try_recv().is_none());

    op.start().await.unwrap();
    assert!(!op.is_prepared());
    let frame = peer.recv_frame().await.unwrap();
    assert_eq!(frame.command, Command::Begin);
    assert_eq!(frame.get_header("receipt"), Some("go"));
    assert!(matches!(op.start().await, Err(StompError::ProtocolViolation(_))));

    peer.send_frame(Frame::receipt_frame("go"));
    assert!(op.wait().await.unwrap().is_some());
}

#[tokio::test]
async fn prepared_operation_cancelled_before_start() {
    let (session, mut peer) = connected().await;
    let mut op = session
        .prepare_operation(Frame::begin("tx"), Expectation::Receipt(Some("held".into())))
        .await
        .unwrap();
    assert_eq!(session.pending_operations().await, 1);
    assert!(op.cancel().await);
    assert_eq!(op.start().await, Err(StompError::Cancelled));
    assert_eq!(session.pending_operations().await, 0);

    session.send("/queue/marker", b"m".to_vec()).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Send);
}

#[tokio::test]
async fn prepared_operation_checks_state_at_start() {
    let (session, mut peer) = open().await;
    let mut op = session
        .prepare_operation(Frame::send("/queue/a", None, "x"), Expectation::None)
        .await
        .unwrap();
    assert!(matches!(op.start().await, Err(StompError::ProtocolViolation(_))));
    assert!(matches!(op.wait().await, Err(StompError::ProtocolViolation(_))));
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn waiting_on_unstarted_operation_is_refused() {
    let (session, _peer) = connected().await;
    let op = session
        .prepare_operation(Frame::begin("tx"), Expectation::Receipt(None))
        .await
        .unwrap();
    assert!(matches!(op.wait().await, Err(StompError::ProtocolViolation(_))));
    assert_eq!(session.pending_operations().await, 0);
}

#[tokio::test]
async fn fire_and_forget_completes_on_write() {
    let (session, mut peer) = connected().await;
    let op = session.send("/queue/a", b"payload".to_vec()).await.unwrap();
    assert_eq!(op.wait().await, Ok(None));
    let frame = peer.recv_frame().await.unwrap();
    assert_eq!(frame.get_header("content-length"), Some("7"));
}

#[tokio::test]
async fn transaction_frames_in_order() {
    let (session, mut peer) = connected().await;
    session.begin("tx-1").await.unwrap();
    session
        .send_frame(Frame::send("/queue/a", None, b"1".to_vec()).header("transaction", "tx-1"))
        .await
        .unwrap();
    session.ack("m-9", Some("tx-1")).await.unwrap();
    session.commit("tx-1").await.unwrap();
    session.abort("tx-2").await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let f = peer.recv_frame().await.unwrap();
        seen.push((f.command, f.get_header("transaction").map(str::to_string)));
    }
    let tx = |s: &str| Some(s.to_string());
    assert_eq!(
        seen,
        vec![
            (Command::Begin, tx("tx-1")),
            (Command::Send, tx("tx-1")),
            (Command::Ack, tx("tx-1")),
            (Command::Commit, tx("tx-1")),
            (Command::Abort, tx("tx-2")),
        ]
    );
}

// ============================================================================
// Failure and teardown
// ============================================================================

#[tokio::test]
async fn broker_error_fails_attributed_then_remaining_operations() {
    let (session, mut peer) = connected().await;
    let mut events = session.events();
    let bad = session
        .send_operation(
            Frame::send("/queue/forbidden", None, b"x".to_vec()),
            Expectation::Receipt(Some("r1".into())),
        )
        .await
        .unwrap();
    let other = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(Some("r2".into())))
        .await
        .unwrap();
    peer.recv_frame().await.unwrap();
    peer.recv_frame().await.unwrap();

    peer.send_frame(Frame::error("access refused", None).header("receipt-id", "r1"));

    match bad.wait().await {
        Err(StompError::Broker(e)) => {
            assert_eq!(e.message, "access refused");
            assert_eq!(e.receipt_id.as_deref(), Some("r1"));
        }
        other => panic!("expected broker error, got {:?}", other),
    }
    assert!(matches!(other.wait().await, Err(StompError::ConnectionLost(_))));

    next_event(&mut events, |e| matches!(e, SessionEvent::BrokerError(_))).await;
    match next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(_))).await {
        SessionEvent::Disconnected(Some(StompError::Broker(e))) => {
            assert_eq!(e.message, "access refused")
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(session.state().await, SessionState::Disconnected);
}

#[tokio::test]
async fn broker_error_while_disconnected_keeps_session() {
    let (session, mut peer) = open().await;
    let mut events = session.events();
    peer.send_frame(Frame::error("stray", None));
    match next_event(&mut events, |e| matches!(e, SessionEvent::BrokerError(_))).await {
        SessionEvent::BrokerError(e) => assert_eq!(e.message, "stray"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(session.state().await, SessionState::Disconnected);

    let op = session.connect(&ConnectOptions::new()).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Connect);
    peer.send_frame(Frame::connected("1.2", None));
    op.wait().await.unwrap();
    assert_eq!(session.state().await, SessionState::Connected);
}

#[tokio::test]
async fn transport_close_fails_pending_operations() {
    let (session, mut peer) = connected().await;
    let mut events = session.events();
    let op = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(None))
        .await
        .unwrap();
    peer.recv_frame().await.unwrap();
    peer.close(Some(1006), "gone", false);

    assert!(matches!(op.wait().await, Err(StompError::ConnectionLost(_))));
    next_event(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected(Some(StompError::ConnectionLost(_))))
    })
    .await;
    assert!(matches!(
        session.send("/queue/a", b"x".to_vec()).await,
        Err(StompError::ConnectionLost(_))
    ));
}

#[tokio::test]
async fn malformed_frame_after_connect_is_reported_not_fatal() {
    let (session, mut peer) = connected().await;
    let mut events = session.events();
    peer.send_bytes(Bytes::from_static(b"NONSENSE\n\n\0"));
    next_event(&mut events, |e| matches!(e, SessionEvent::Malformed(_))).await;

    session.send("/queue/a", b"still here".to_vec()).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().body, b"still here");
    assert_eq!(session.state().await, SessionState::Connected);
}

#[tokio::test]
async fn disconnect_waits_for_receipt() {
    let (session, mut peer) = connected().await;
    let mut events = session.events();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .subscribe("/topic/a", SubscriptionOptions::default(), move |f| {
            let _ = tx.send(f);
        })
        .await
        .unwrap();
    peer.recv_frame().await.unwrap();

    let op = session.disconnect().await.unwrap();
    assert_eq!(session.state().await, SessionState::Disconnecting);
    let frame = peer.recv_frame().await.unwrap();
    assert_eq!(frame.command, Command::Disconnect);
    let receipt = frame.get_header("receipt").unwrap().to_string();
    assert_eq!(op.receipt_id(), Some(receipt.as_str()));

    assert!(matches!(
        session.send("/queue/a", b"x".to_vec()).await,
        Err(StompError::ProtocolViolation(_))
    ));

    peer.send_frame(Frame::receipt_frame(&receipt));
    assert!(op.wait().await.unwrap().is_some());
    next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(None))).await;
    assert_eq!(session.state().await, SessionState::Disconnected);
    assert_eq!(rx.recv().await, None);
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn close_tears_down_without_disconnect_frame() {
    let (session, mut peer) = connected().await;
    let op = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(None))
        .await
        .unwrap();
    peer.recv_frame().await.unwrap();
    session.close().await;
    assert!(matches!(op.wait().await, Err(StompError::ConnectionLost(_))));
    assert_eq!(peer.recv().await, None);
}

// ============================================================================
// Heart-beats
// ============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeats_are_emitted_at_negotiated_interval() {
    let (session, mut peer) = connected_with(
        Some(Heartbeat::new(1000, 0)),
        Some(Heartbeat::new(0, 1000)),
    )
    .await;

    let beat = peer.recv().await.unwrap();
    assert_eq!(&beat[..], b"\n");
    tokio::time::sleep(Duration::from_millis(1)).await;
    let stats = session.heartbeat_stats().await;
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.outgoing, Some(Duration::from_millis(1000)));
    assert_eq!(stats.incoming, None);
}

#[tokio::test(start_paused = true)]
async fn recent_frame_suppresses_heartbeat_tick() {
    let (session, mut peer) = connected_with(
        Some(Heartbeat::new(1000, 0)),
        Some(Heartbeat::new(0, 1000)),
    )
    .await;

    tokio::time::advance(Duration::from_millis(900)).await;
    session.send("/queue/a", b"busy".to_vec()).await.unwrap();
    assert_eq!(peer.recv_frame().await.unwrap().command, Command::Send);

    // the tick at 1000ms sees outbound traffic 100ms old
    tokio::time::advance(Duration::from_millis(150)).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(peer.try_recv().is_none());
    assert_eq!(session.heartbeat_stats().await.sent, 0);

    let beat = peer.recv().await.unwrap();
    assert_eq!(&beat[..], b"\n");
}

#[tokio::test(start_paused = true)]
async fn inbound_heartbeats_are_counted() {
    let (session, peer) = connected_with(
        Some(Heartbeat::new(0, 1000)),
        Some(Heartbeat::new(1000, 0)),
    )
    .await;

    peer.send_heartbeat();
    tokio::time::sleep(Duration::from_millis(400)).await;
    peer.send_heartbeat();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = session.heartbeat_stats().await;
    assert_eq!(stats.received, 2);
    assert_eq!(stats.previous_received_interval, Some(Duration::from_millis(400)));
    assert_eq!(session.state().await, SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_triggers_liveness_failure() {
    let (session, _peer) = connected_with(
        Some(Heartbeat::new(0, 1000)),
        Some(Heartbeat::new(1000, 0)),
    )
    .await;
    let mut events = session.events();
    let pending = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(None))
        .await
        .unwrap();

    match next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(_))).await {
        SessionEvent::Disconnected(Some(StompError::ConnectionLost(_))) => {}
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(pending.wait().await, Err(StompError::ConnectionLost(_))));
    assert_eq!(session.state().await, SessionState::Disconnected);
}

#[tokio::test]
async fn wait_timeout_cancels_unanswered_operation() {
    let (session, mut peer) = connected().await;
    let op = session
        .send_operation(Frame::begin("tx"), Expectation::Receipt(Some("never".into())))
        .await
        .unwrap();
    peer.recv_frame().await.unwrap();
    let res = op.wait_timeout(Duration::from_millis(20)).await;
    assert_eq!(res, Err(StompError::Timeout("never".into())));
    assert_eq!(session.pending_operations().await, 0);
}
