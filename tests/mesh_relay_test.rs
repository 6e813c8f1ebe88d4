//! E2E tests for the mesh client against an in-process relay
//!
//! Tests the full flow: connect → authenticate → call → mesh negotiation → hangup
//! Also covers heartbeat expiry, malformed frames and connection refused.

mod common;

use std::time::Duration;

use common::{connected_to, TestClient, TestRelay};
use meshcall::mesh::MeshEvent;
use meshcall::network::{ChannelState, Role};
use meshcall::PeerId;

/// Find the role `snapshot` holds for `peer`
fn role_of(snapshot: &meshcall::MeshSnapshot, peer: u64) -> Option<Role> {
    snapshot
        .peers
        .iter()
        .find(|p| p.peer_id == PeerId(peer))
        .map(|p| p.role)
}

/// Test: Three participants form a full mesh
/// Given a running relay
/// When three clients join the call one after another
/// Then every client is connected to both others, with one offerer per pair
#[tokio::test]
async fn test_three_clients_form_full_mesh() {
    let relay = TestRelay::start().await;

    let mut clients = Vec::new();
    for user in [1, 2, 3] {
        let mut client = TestClient::connected(&relay, user).await;
        client.handle.call().await.expect("Failed to call");
        assert!(
            client
                .wait_for(|e| matches!(e, MeshEvent::MembershipReconciled { .. }))
                .await
                .is_some(),
            "User {} should receive the membership",
            user
        );
        clients.push(client);
    }

    let expected = [vec![2, 3], vec![1, 3], vec![1, 2]];
    let mut snapshots = Vec::new();
    for (client, peers) in clients.iter().zip(expected.iter()) {
        let snapshot = client.wait_until(|s| connected_to(s, peers)).await;
        assert!(
            connected_to(&snapshot, peers),
            "User {} should be connected to {:?}, got {:?}",
            client.user,
            peers,
            snapshot.peers
        );
        assert!(snapshot.peers.iter().all(|p| p.stats_verified));
        snapshots.push(snapshot);
    }

    for (a, b) in [(0usize, 1usize), (0, 2), (1, 2)] {
        let a_offers = role_of(&snapshots[a], clients[b].user) == Some(Role::Offerer);
        let b_offers = role_of(&snapshots[b], clients[a].user) == Some(Role::Offerer);
        assert!(
            a_offers ^ b_offers,
            "Exactly one of users {} and {} should offer",
            clients[a].user,
            clients[b].user
        );
    }

    // Later joiners offer to everyone already present
    assert_eq!(role_of(&snapshots[2], 1), Some(Role::Offerer));
    assert_eq!(role_of(&snapshots[2], 2), Some(Role::Offerer));
    assert_eq!(relay.room(), vec![1, 2, 3]);

    for client in clients {
        client.shutdown().await;
    }
}

/// Test: Leaving and rejoining the call
/// Given two connected participants
/// When one hangs up and calls again
/// Then the other removes and then re-adds it as answerer
#[tokio::test]
async fn test_hangup_and_rejoin() {
    let relay = TestRelay::start().await;
    let mut first = TestClient::connected(&relay, 10).await;
    let mut second = TestClient::connected(&relay, 20).await;

    first.handle.call().await.expect("Failed to call");
    second.handle.call().await.expect("Failed to call");
    assert!(connected_to(&first.wait_until(|s| connected_to(s, &[20])).await, &[20]));

    assert!(second.handle.hangup().await.unwrap());
    assert!(first
        .wait_for(|e| *e == MeshEvent::PeerRemoved { peer_id: PeerId(20) })
        .await
        .is_some());
    assert!(first
        .wait_for(|e| *e == MeshEvent::MembershipReconciled { peers: vec![] })
        .await
        .is_some());
    assert!(second.snapshot().await.peers.is_empty());
    assert_eq!(relay.room(), vec![10]);

    second.handle.call().await.expect("Failed to call again");
    let snapshot = first.wait_until(|s| connected_to(s, &[20])).await;
    assert!(connected_to(&snapshot, &[20]));
    assert_eq!(role_of(&snapshot, 20), Some(Role::Answerer));
    assert_eq!(
        role_of(&second.snapshot().await, 10),
        Some(Role::Offerer)
    );

    first.shutdown().await;
    second.shutdown().await;
}

/// Test: Departure without hangup
/// Given two connected participants
/// When one disconnects from the relay
/// Then the relay's membership update removes it from the other
#[tokio::test]
async fn test_disconnect_removes_peer() {
    let relay = TestRelay::start().await;
    let mut first = TestClient::connected(&relay, 1).await;
    let second = TestClient::connected(&relay, 2).await;

    first.handle.call().await.expect("Failed to call");
    second.handle.call().await.expect("Failed to call");
    first.wait_until(|s| connected_to(s, &[2])).await;

    assert!(second.handle.disconnect().await.unwrap());
    assert!(!second.handle.disconnect().await.unwrap());
    assert!(first
        .wait_for(|e| *e == MeshEvent::PeerRemoved { peer_id: PeerId(2) })
        .await
        .is_some());

    let snapshot = second.snapshot().await;
    assert_eq!(snapshot.channel, ChannelState::Disconnected);
    assert!(!snapshot.in_call);

    first.shutdown().await;
    second.shutdown().await;
}

/// Test: Heartbeat expiry
/// Given a relay that stops answering PING
/// When the pong timeout elapses
/// Then the channel closes exactly once
#[tokio::test]
async fn test_silent_relay_closes_channel_once() {
    let relay = TestRelay::start().await;
    relay.mute_pongs();

    let mut config = TestClient::config(&relay.url(), 7);
    config.ping_interval_ms = 50;
    config.pong_timeout_ms = 200;
    let mut client = TestClient::spawn(config);
    client.handle.connect().await.expect("Failed to connect");

    let closed = client
        .wait_for(|e| matches!(e, MeshEvent::ChannelClosed(_)))
        .await;
    match closed {
        Some(MeshEvent::ChannelClosed(info)) => assert!(!info.clean),
        other => panic!("Expected ChannelClosed, got {:?}", other),
    }

    let later = client.drain_for(Duration::from_millis(500)).await;
    assert!(
        !later
            .iter()
            .any(|e| matches!(e, MeshEvent::ChannelClosed(_))),
        "Channel should close only once, got {:?}",
        later
    );
    assert_eq!(client.snapshot().await.channel, ChannelState::Disconnected);

    client.shutdown().await;
}

/// Test: Malformed frames are dropped
/// Given an authenticated client
/// When the relay sends frames that are not valid messages
/// Then the channel stays up and the call still works
#[tokio::test]
async fn test_malformed_frame_keeps_channel() {
    let relay = TestRelay::start().await;
    let mut client = TestClient::connected(&relay, 3).await;

    relay.send_raw(3, "not json");
    relay.send_raw(3, r#"{"event":"offer","to":3}"#);
    relay.send_raw(3, r#"{"from":99,"to":3,"event":"candidate","data":{}}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.snapshot().await.channel, ChannelState::Authenticated);

    client.handle.call().await.expect("Failed to call");
    assert_eq!(
        client
            .wait_for(|e| matches!(e, MeshEvent::MembershipReconciled { .. }))
            .await,
        Some(MeshEvent::MembershipReconciled { peers: vec![] })
    );

    client.shutdown().await;
}

/// Test: Connection refused
/// Given no relay listening
/// When the client connects
/// Then an error and a close are reported
#[tokio::test]
async fn test_connection_refused() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        listener.local_addr().expect("Failed to get address").port()
    };

    let mut client = TestClient::spawn(TestClient::config(&format!("ws://127.0.0.1:{}", port), 1));
    client.handle.connect().await.expect("Connect request should be accepted");

    assert!(client
        .wait_for(|e| matches!(e, MeshEvent::ChannelError(_)))
        .await
        .is_some());
    assert!(client
        .wait_for(|e| matches!(e, MeshEvent::ChannelClosed(_)))
        .await
        .is_some());

    // A new attempt is allowed once closed
    assert!(client.handle.connect().await.is_ok());

    client.shutdown().await;
}

/// Test: Call before authentication
/// Given a client that never connected
/// When it calls
/// Then the call is rejected
#[tokio::test]
async fn test_call_requires_authentication() {
    let client = TestClient::spawn(TestClient::config("ws://127.0.0.1:9", 1));
    assert!(matches!(
        client.handle.call().await,
        Err(meshcall::MeshError::NotAuthenticated)
    ));
    client.shutdown().await;
}
