//! Signaling relay integration tests.
//!
//! Every client here is an in-process `LocalConnection`, so the relay runs
//! its real session, stream and connection actors without sockets.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::protocol::{
    ControlFrame, ErrorCode, LeaveReason, ServerFrame, SignalType, CLOSE_STREAM_ENDED,
    CLOSE_SUPERSEDED,
};
use common::types::{PeerRole, Stream};
use relay_service::relay::LocalConnection;
use relay_test_utils::{
    answer, heartbeat, ice_candidate, join, leave, offer, TestRelay, TestStream,
};
use std::time::Duration;

const HOST: &str = "host-1";

async fn next_frame(conn: &mut LocalConnection) -> ServerFrame {
    tokio::time::timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
}

async fn expect_control(conn: &mut LocalConnection) -> ControlFrame {
    match next_frame(conn).await {
        ServerFrame::Control(frame) => frame,
        other => panic!("expected a control frame, got {other:?}"),
    }
}

/// Round-trip a heartbeat so every earlier frame from `conn` has been handled.
async fn sync(conn: &mut LocalConnection, stream_id: &str, peer_id: &str) {
    conn.send(&heartbeat(stream_id, peer_id)).await.unwrap();
    assert_eq!(
        expect_control(conn).await,
        ControlFrame::HeartbeatAck,
        "expected no frames before the heartbeat ack"
    );
}

async fn joined(relay: &TestRelay, stream_id: &str, peer_id: &str) -> (LocalConnection, usize) {
    let mut conn = relay.connect();
    conn.send(&join(stream_id, peer_id)).await.unwrap();
    match expect_control(&mut conn).await {
        ControlFrame::Joined { replayed, .. } => (conn, replayed),
        other => panic!("expected joined, got {other:?}"),
    }
}

async fn expect_peer_joined(conn: &mut LocalConnection, peer_id: &str) {
    match expect_control(conn).await {
        ControlFrame::PeerJoined { peer_id: joined, .. } => assert_eq!(joined, peer_id),
        other => panic!("expected peer-joined, got {other:?}"),
    }
}

async fn setup() -> (TestRelay, Stream, LocalConnection) {
    let relay = TestRelay::new();
    let stream = relay.create_stream(&TestStream::new("Evening Show", HOST)).await;
    let (host, replayed) = joined(&relay, &stream.id, HOST).await;
    assert_eq!(replayed, 0);
    (relay, stream, host)
}

#[tokio::test]
async fn test_broadcaster_joins_as_publisher() {
    let relay = TestRelay::new();
    let stream = relay.create_stream(&TestStream::new("Roles", HOST)).await;

    let mut host = relay.connect();
    host.send(&join(&stream.id, HOST)).await.unwrap();
    match expect_control(&mut host).await {
        ControlFrame::Joined { role, peer_id, .. } => {
            assert_eq!(role, PeerRole::Publisher);
            assert_eq!(peer_id, HOST);
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut listener = relay.connect();
    listener.send(&join(&stream.id, "listener-a")).await.unwrap();
    match expect_control(&mut listener).await {
        ControlFrame::Joined { role, .. } => assert_eq!(role, PeerRole::Subscriber),
        other => panic!("unexpected {other:?}"),
    }

    // Only subscribers count as listeners
    assert_eq!(relay.stream(&stream.id).await.listener_count, 1);
}

#[tokio::test]
async fn test_late_joiner_receives_stored_offer() {
    let (relay, stream, mut host) = setup().await;

    host.send(&offer(&stream.id, HOST)).await.unwrap();
    sync(&mut host, &stream.id, HOST).await;

    let (mut listener, replayed) = joined(&relay, &stream.id, "listener-a").await;
    assert_eq!(replayed, 1);

    match next_frame(&mut listener).await {
        ServerFrame::Signal(envelope) => {
            assert_eq!(envelope.signal_type, SignalType::Offer);
            assert_eq!(envelope.sender_id, HOST);
        }
        other => panic!("expected replayed offer, got {other:?}"),
    }
    expect_peer_joined(&mut host, "listener-a").await;
}

#[tokio::test]
async fn test_replay_is_most_recent_first() {
    let (relay, stream, mut host) = setup().await;

    for n in 0..3 {
        let envelope = offer(&stream.id, HOST).with_data(serde_json::json!({ "n": n }));
        host.send(&envelope).await.unwrap();
    }
    sync(&mut host, &stream.id, HOST).await;

    let (mut listener, replayed) = joined(&relay, &stream.id, "listener-a").await;
    assert_eq!(replayed, 3);

    let mut order = Vec::new();
    for _ in 0..3 {
        if let ServerFrame::Signal(envelope) = next_frame(&mut listener).await {
            order.push(envelope.data.unwrap()["n"].as_i64().unwrap());
        }
    }
    assert_eq!(order, vec![2, 1, 0]);
}

#[tokio::test]
async fn test_offer_is_forwarded_to_connected_listeners_only() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    let (mut b, _) = joined(&relay, &stream.id, "listener-b").await;
    expect_peer_joined(&mut host, "listener-a").await;
    expect_peer_joined(&mut host, "listener-b").await;
    expect_peer_joined(&mut a, "listener-b").await;

    host.send(&offer(&stream.id, HOST)).await.unwrap();
    sync(&mut host, &stream.id, HOST).await;

    for listener in [&mut a, &mut b] {
        match next_frame(listener).await {
            ServerFrame::Signal(envelope) => assert_eq!(envelope.signal_type, SignalType::Offer),
            other => panic!("expected offer, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_answer_is_routed_to_receiver_only() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    let (mut b, _) = joined(&relay, &stream.id, "listener-b").await;
    expect_peer_joined(&mut host, "listener-a").await;
    expect_peer_joined(&mut host, "listener-b").await;
    expect_peer_joined(&mut a, "listener-b").await;

    a.send(&answer(&stream.id, "listener-a", HOST)).await.unwrap();
    a.send(&ice_candidate(&stream.id, "listener-a", HOST))
        .await
        .unwrap();
    sync(&mut a, &stream.id, "listener-a").await;

    match next_frame(&mut host).await {
        ServerFrame::Signal(envelope) => {
            assert_eq!(envelope.signal_type, SignalType::Answer);
            assert_eq!(envelope.receiver_id.as_deref(), Some(HOST));
        }
        other => panic!("expected answer, got {other:?}"),
    }
    assert_eq!(next_frame(&mut host).await.kind(), "ice-candidate");

    // B saw none of it
    sync(&mut b, &stream.id, "listener-b").await;
}

#[tokio::test]
async fn test_signal_to_offline_receiver_is_stored_not_an_error() {
    let (relay, stream, mut host) = setup().await;

    let addressed = offer(&stream.id, HOST).to_peer("listener-late");
    host.send(&addressed).await.unwrap();
    sync(&mut host, &stream.id, HOST).await;

    let (mut late, replayed) = joined(&relay, &stream.id, "listener-late").await;
    assert_eq!(replayed, 1);
    assert_eq!(next_frame(&mut late).await.kind(), "offer");

    // Addressed to someone else: not replayed
    let (_other, replayed) = joined(&relay, &stream.id, "listener-other").await;
    assert_eq!(replayed, 0);
}

#[tokio::test]
async fn test_second_publisher_is_rejected_and_stays_open() {
    let (relay, stream, _host) = setup().await;

    let mut intruder = relay.connect();
    intruder.send(&join(&stream.id, HOST)).await.unwrap();
    match expect_control(&mut intruder).await {
        ControlFrame::Error { code, .. } => assert_eq!(code, ErrorCode::DuplicatePublisher),
        other => panic!("expected duplicate publisher, got {other:?}"),
    }

    sync(&mut intruder, &stream.id, HOST).await;
    assert!(intruder.close_frame().is_none());
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;
    assert_eq!(relay.stream(&stream.id).await.listener_count, 1);

    a.send(&leave(&stream.id, "listener-a")).await.unwrap();
    a.send(&leave(&stream.id, "listener-a")).await.unwrap();
    sync(&mut a, &stream.id, "listener-a").await;
    assert!(a.close_frame().is_none());

    match expect_control(&mut host).await {
        ControlFrame::PeerLeft {
            peer_id, reason, ..
        } => {
            assert_eq!(peer_id, "listener-a");
            assert_eq!(reason, LeaveReason::Voluntary);
        }
        other => panic!("expected peer-left, got {other:?}"),
    }
    sync(&mut host, &stream.id, HOST).await;

    assert_eq!(relay.stream(&stream.id).await.listener_count, 0);
    assert_eq!(relay.store().purge_sender_calls(), 1);
}

#[tokio::test]
async fn test_leave_purges_only_the_leaving_peer() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;

    host.send(&offer(&stream.id, HOST)).await.unwrap();
    sync(&mut host, &stream.id, HOST).await;
    a.send(&answer(&stream.id, "listener-a", HOST)).await.unwrap();
    assert_eq!(next_frame(&mut a).await.kind(), "offer");
    sync(&mut a, &stream.id, "listener-a").await;
    assert_eq!(relay.store().stored(&stream.id).await, 2);

    a.send(&leave(&stream.id, "listener-a")).await.unwrap();
    sync(&mut a, &stream.id, "listener-a").await;

    assert_eq!(relay.store().stored(&stream.id).await, 1);
}

#[tokio::test]
async fn test_rejoin_after_leave_is_fresh_join() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;

    a.send(&leave(&stream.id, "listener-a")).await.unwrap();
    a.send(&join(&stream.id, "listener-a")).await.unwrap();
    assert_eq!(
        expect_control(&mut a).await,
        ControlFrame::Joined {
            stream_id: stream.id.clone(),
            peer_id: "listener-a".to_string(),
            role: PeerRole::Subscriber,
            replayed: 0,
        }
    );

    assert!(matches!(
        expect_control(&mut host).await,
        ControlFrame::PeerLeft { .. }
    ));
    expect_peer_joined(&mut host, "listener-a").await;
}

#[tokio::test]
async fn test_reconnect_within_grace_is_silent() {
    let (relay, stream, mut host) = setup().await;
    let (a, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;

    a.disconnect().await;
    assert!(!relay
        .app()
        .registry()
        .is_connected("listener-a")
        .await
        .unwrap());
    assert_eq!(relay.stream(&stream.id).await.listener_count, 1);

    let (_a, _) = joined(&relay, &stream.id, "listener-a").await;
    assert!(relay
        .app()
        .registry()
        .is_connected("listener-a")
        .await
        .unwrap());

    // No peer-left or peer-joined reached the broadcaster
    sync(&mut host, &stream.id, HOST).await;
    assert_eq!(relay.stream(&stream.id).await.listener_count, 1);
}

#[tokio::test]
async fn test_subscriber_on_new_connection_supersedes_old() {
    let (relay, stream, mut host) = setup().await;
    let (mut first, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;

    let (_second, _) = joined(&relay, &stream.id, "listener-a").await;

    assert!(first.recv().await.is_none());
    assert_eq!(first.close_frame().unwrap().0, CLOSE_SUPERSEDED);

    sync(&mut host, &stream.id, HOST).await;
    assert_eq!(relay.stream(&stream.id).await.listener_count, 1);
}

#[tokio::test]
async fn test_frames_for_another_stream_are_rejected() {
    let (relay, stream, mut host) = setup().await;
    let other = relay.create_stream(&TestStream::new("Other", "host-2")).await;

    host.send(&offer(&other.id, HOST)).await.unwrap();
    match expect_control(&mut host).await {
        ControlFrame::Error { code, .. } => assert_eq!(code, ErrorCode::ValidationError),
        other => panic!("expected validation error, got {other:?}"),
    }

    host.send(&offer(&stream.id, "someone-else")).await.unwrap();
    match expect_control(&mut host).await {
        ControlFrame::Error { code, .. } => assert_eq!(code, ErrorCode::ValidationError),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(relay.store().append_calls(), 0);
}

#[tokio::test]
async fn test_offer_without_data_is_rejected() {
    let (_relay, stream, mut host) = setup().await;

    host.send_text(format!(
        r#"{{"type":"offer","streamId":"{}","senderId":"{HOST}"}}"#,
        stream.id
    ))
    .await
    .unwrap();

    match expect_control(&mut host).await {
        ControlFrame::Error { code, .. } => assert_eq!(code, ErrorCode::ValidationError),
        other => panic!("expected validation error, got {other:?}"),
    }
    sync(&mut host, &stream.id, HOST).await;
}

#[tokio::test]
async fn test_store_failure_warns_sender_and_still_forwards() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;

    relay.store().fail_next_appends(2);
    host.send(&offer(&stream.id, HOST)).await.unwrap();

    match expect_control(&mut host).await {
        ControlFrame::Warning { code, .. } => assert_eq!(code, ErrorCode::RelayUnavailable),
        other => panic!("expected relay-unavailable warning, got {other:?}"),
    }
    assert_eq!(next_frame(&mut a).await.kind(), "offer");
    assert_eq!(relay.store().append_calls(), 2);
    assert!(host.close_frame().is_none());
}

#[tokio::test]
async fn test_single_store_failure_is_retried_silently() {
    let (relay, stream, mut host) = setup().await;

    relay.store().fail_next_appends(1);
    host.send(&offer(&stream.id, HOST)).await.unwrap();
    sync(&mut host, &stream.id, HOST).await;

    assert_eq!(relay.store().append_calls(), 2);
    assert_eq!(relay.store().stored(&stream.id).await, 1);
}

#[tokio::test]
async fn test_replay_failure_degrades_to_warning() {
    let (relay, stream, _host) = setup().await;
    relay.store().set_failing(true);

    let (mut listener, replayed) = joined(&relay, &stream.id, "listener-a").await;
    assert_eq!(replayed, 0);
    match expect_control(&mut listener).await {
        ControlFrame::Warning { code, .. } => assert_eq!(code, ErrorCode::RelayUnavailable),
        other => panic!("expected warning, got {other:?}"),
    }
    assert_eq!(relay.stream(&stream.id).await.listener_count, 1);
}

#[tokio::test]
async fn test_end_stream_closes_every_peer() {
    let (relay, stream, mut host) = setup().await;
    let (mut a, _) = joined(&relay, &stream.id, "listener-a").await;
    expect_peer_joined(&mut host, "listener-a").await;

    let ended = relay.app().lifecycle().end_stream(&stream.id).await.unwrap();
    assert!(!ended.is_active);
    assert_eq!(ended.listener_count, 0);

    for conn in [&mut host, &mut a] {
        assert_eq!(
            expect_control(conn).await,
            ControlFrame::StreamEnded {
                stream_id: stream.id.clone()
            }
        );
        assert!(conn.recv().await.is_none());
        assert_eq!(conn.close_frame().unwrap().0, CLOSE_STREAM_ENDED);
    }

    // No new joins on an ended stream
    let mut late = relay.connect();
    late.send(&join(&stream.id, "listener-b")).await.unwrap();
    match expect_control(&mut late).await {
        ControlFrame::Error { code, .. } => assert_eq!(code, ErrorCode::StreamNotActive),
        other => panic!("expected stream-not-active, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offers_racing_end_stream_leave_nothing_stored() {
    for _ in 0..20 {
        let (relay, stream, mut host) = setup().await;
        let lifecycle = relay.app().lifecycle().clone();
        let stream_id = stream.id.clone();
        let ending = tokio::spawn(async move { lifecycle.end_stream(&stream_id).await });

        for _ in 0..20 {
            if host.send(&offer(&stream.id, HOST)).await.is_err() {
                break;
            }
        }
        ending.await.unwrap().unwrap();
        while tokio::time::timeout(Duration::from_secs(2), host.recv())
            .await
            .expect("connection never closed")
            .is_some()
        {}

        // Frames still buffered in the session must not outlive the stream
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.store().stored(&stream.id).await, 0);
    }
}

#[tokio::test]
async fn test_offer_after_end_stream_is_not_stored() {
    let (relay, stream, host) = setup().await;
    let appends = relay.store().append_calls();
    relay.app().lifecycle().end_stream(&stream.id).await.unwrap();

    // The session may still be draining; either way nothing is written
    let _ = host.send(&offer(&stream.id, HOST)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.store().append_calls(), appends);
    assert_eq!(relay.store().stored(&stream.id).await, 0);
}

#[tokio::test]
async fn test_many_listeners_converge_on_listener_count() {
    let (relay, stream, _host) = setup().await;

    let mut tasks = Vec::new();
    for n in 0..20 {
        let conn = relay.connect();
        let stream_id = stream.id.clone();
        tasks.push(tokio::spawn(async move {
            let mut conn = conn;
            let peer = format!("listener-{n}");
            conn.send(&join(&stream_id, &peer)).await.unwrap();
            loop {
                if let ServerFrame::Control(ControlFrame::Joined { .. }) =
                    conn.recv().await.unwrap()
                {
                    break;
                }
            }
            if n % 2 == 0 {
                conn.send(&leave(&stream_id, &peer)).await.unwrap();
                conn.send(&heartbeat(&stream_id, &peer)).await.unwrap();
                loop {
                    if let ServerFrame::Control(ControlFrame::HeartbeatAck) =
                        conn.recv().await.unwrap()
                    {
                        break;
                    }
                }
            }
            conn
        }));
    }

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap());
    }

    let peers = relay
        .app()
        .registry()
        .list_peers(&stream.id, Some(HOST))
        .await
        .unwrap();
    assert_eq!(peers.len(), 10);
    assert_eq!(relay.stream(&stream.id).await.listener_count, 10);
}
