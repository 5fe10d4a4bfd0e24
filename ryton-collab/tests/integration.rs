//! End-to-end tests: real hubs on loopback, real WebSocket signaling and
//! real WebRTC connections (loopback ICE candidates, no STUN).

use ryton_collab::hub::status;
use ryton_collab::{
    CallError, CallState, CollabConfig, CollabEvent, CollaborationHub, ConnectionConfig, ConnectionState,
    DiscoveryConfig, PeerKey,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

fn test_config(name: &str) -> CollabConfig {
    CollabConfig {
        instance_name: name.to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        discovery: DiscoveryConfig {
            enabled: false,
            ..DiscoveryConfig::default()
        },
        connection: ConnectionConfig {
            ice_servers: Vec::new(),
            negotiation_timeout: Duration::from_secs(15),
            include_loopback_candidates: true,
        },
    }
}

async fn start(name: &str) -> (CollaborationHub, mpsc::UnboundedReceiver<CollabEvent>) {
    let mut hub = CollaborationHub::start(test_config(name)).await;
    let rx = hub.take_event_rx().unwrap();
    (hub, rx)
}

/// Loopback key of a hub's signaling endpoint.
fn key_of(hub: &CollaborationHub) -> PeerKey {
    SocketAddr::from(([127, 0, 0, 1], hub.identity().listen_port()))
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<CollabEvent>,
    mut pred: impl FnMut(&CollabEvent) -> bool,
) -> CollabEvent {
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_status(rx: &mut mpsc::UnboundedReceiver<CollabEvent>, peer: Option<PeerKey>, text: &str) {
    wait_for(rx, |e| {
        matches!(e, CollabEvent::ConnectionStatus { address, status } if *address == peer && status == text)
    })
    .await;
}

/// Connect `a` to `b` and wait until both report the connection.
async fn connect_pair(
    a: &CollaborationHub,
    a_rx: &mut mpsc::UnboundedReceiver<CollabEvent>,
    b: &CollaborationHub,
    b_rx: &mut mpsc::UnboundedReceiver<CollabEvent>,
) -> (PeerKey, PeerKey) {
    let b_key = key_of(b);
    let a_key = key_of(a);
    assert!(a.connect(&b_key.to_string()).await);
    wait_status(a_rx, Some(b_key), status::CONNECTED).await;
    wait_status(b_rx, Some(a_key), status::CONNECTED).await;
    (b_key, a_key)
}

#[tokio::test]
async fn test_hub_binds_ephemeral_port() {
    let (hub, _rx) = start("Alice").await;
    assert_ne!(hub.identity().listen_port(), 0);
    assert_eq!(hub.identity().name(), "Alice");
    hub.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_self_is_rejected() {
    let (hub, mut rx) = start("Alice").await;
    let own = key_of(&hub);

    // No port means our own signaling port.
    assert!(!hub.connect("127.0.0.1").await);
    wait_status(&mut rx, Some(own), "self-connection is not allowed").await;

    assert!(!hub.connect(&own.to_string()).await);
    assert!(hub.connection_state(&own).await.is_none());
    assert!(hub.known_peers().await.is_empty());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_invalid_address_reports_status() {
    let (hub, mut rx) = start("Alice").await;
    assert!(!hub.connect("10.0.0.1:notaport").await);
    wait_status(&mut rx, None, "invalid address: 10.0.0.1:notaport").await;
    hub.shutdown().await;
}

#[tokio::test]
async fn test_unread_events_do_not_block_commands() {
    let (hub, mut rx) = start("Alice").await;
    let own = key_of(&hub);

    // Nobody reads the event stream while the refusals pile up.
    for _ in 0..300 {
        assert!(!hub.connect("127.0.0.1").await);
    }
    let refused = timeout(Duration::from_secs(3), hub.connect("10.0.0.1:notaport")).await;
    assert_eq!(refused, Ok(false));

    let mut self_refusals = 0;
    let mut invalid = false;
    while self_refusals < 300 || !invalid {
        match wait_for(&mut rx, |e| matches!(e, CollabEvent::ConnectionStatus { .. })).await {
            CollabEvent::ConnectionStatus { address: Some(address), status } => {
                assert_eq!(address, own);
                assert_eq!(status, "self-connection is not allowed");
                self_refusals += 1;
            }
            CollabEvent::ConnectionStatus { address: None, status } => {
                assert_eq!(status, "invalid address: 10.0.0.1:notaport");
                invalid = true;
            }
            _ => unreachable!(),
        }
    }
    timeout(Duration::from_secs(3), hub.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_host_names_resolve_in_background() {
    let (hub, mut rx) = start("Alice").await;
    let own = key_of(&hub);

    // Accepted as well formed; the lookup result arrives as an event.
    let accepted = timeout(Duration::from_secs(1), hub.connect("localhost")).await;
    assert_eq!(accepted, Ok(true));
    wait_status(&mut rx, Some(own), "self-connection is not allowed").await;
    assert!(hub.connection_state(&own).await.is_none());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_listener_unavailable_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = test_config("Alice");
    config.listen_addr = taken.local_addr().unwrap();

    let mut hub = CollaborationHub::start(config).await;
    let mut rx = hub.take_event_rx().unwrap();
    let event = wait_for(&mut rx, |_| true).await;
    match event {
        CollabEvent::ConnectionStatus { address: None, status } => {
            assert!(status.starts_with("signaling unavailable"), "{status}");
        }
        other => panic!("Expected signaling status, got {other:?}"),
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn test_peers_connect_and_exchange_messages() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, alice_key) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    assert_eq!(alice.connection_state(&bob_key).await, Some(ConnectionState::Open));
    assert_eq!(bob.connection_state(&alice_key).await, Some(ConnectionState::Open));

    // Both sides learned the other's configured name.
    let names: Vec<String> = alice.known_peers().await.into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Bob".to_string()]);
    let names: Vec<String> = bob.known_peers().await.into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Alice".to_string()]);

    for text in ["m1", "m2", "m3"] {
        assert!(alice.send(bob_key, text).await);
    }
    let mut received = Vec::new();
    while received.len() < 3 {
        if let CollabEvent::MessageReceived { address, text } =
            wait_for(&mut bob_rx, |e| matches!(e, CollabEvent::MessageReceived { .. })).await
        {
            assert_eq!(address, alice_key);
            received.push(text);
        }
    }
    assert_eq!(received, vec!["m1", "m2", "m3"]);

    assert!(bob.send(alice_key, "hello").await);
    let reply = wait_for(&mut alice_rx, |e| matches!(e, CollabEvent::MessageReceived { .. })).await;
    assert_eq!(
        reply,
        CollabEvent::MessageReceived {
            address: bob_key,
            text: "hello".into()
        }
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_connect_is_rejected() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, _) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    assert!(!alice.connect(&bob_key.to_string()).await);
    wait_status(&mut alice_rx, Some(bob_key), "already connected").await;
    assert_eq!(alice.connection_state(&bob_key).await, Some(ConnectionState::Open));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_send_to_unknown_peer_fails() {
    let (hub, _rx) = start("Alice").await;
    let stranger: PeerKey = "127.0.0.1:9".parse().unwrap();
    assert!(!hub.send(stranger, "anyone there?").await);
    assert!(hub.send_message(stranger, "anyone there?").await.is_err());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_remote() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, alice_key) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    alice.shutdown().await;
    alice.shutdown().await;
    assert!(alice.connection_state(&bob_key).await.is_none());
    assert!(!alice.connect(&bob_key.to_string()).await);

    wait_status(&mut bob_rx, Some(alice_key), status::DISCONNECTED).await;
    wait_for(&mut bob_rx, |e| *e == CollabEvent::PeerLost { address: alice_key }).await;
    assert!(bob.connection_state(&alice_key).await.is_none());
    assert!(!bob.send(alice_key, "gone").await);

    bob.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, alice_key) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    alice.disconnect(bob_key).await;
    assert!(alice.connection_state(&bob_key).await.is_none());
    wait_status(&mut alice_rx, Some(bob_key), status::DISCONNECTED).await;
    wait_status(&mut bob_rx, Some(alice_key), status::DISCONNECTED).await;

    // Terminal entries are gone, so a fresh connect is allowed.
    connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;
    assert!(alice.send(bob_key, "again").await);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_close_while_connecting_aborts_negotiation() {
    let (alice, mut alice_rx) = start("Alice").await;

    // Accepts TCP and never completes the WebSocket handshake.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_key = silent.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    assert!(alice.connect(&silent_key.to_string()).await);
    wait_status(&mut alice_rx, Some(silent_key), status::CONNECTING).await;
    assert_eq!(alice.connection_state(&silent_key).await, Some(ConnectionState::Connecting));

    timeout(Duration::from_secs(5), alice.disconnect(silent_key))
        .await
        .expect("close hung during negotiation");
    assert!(alice.connection_state(&silent_key).await.is_none());
    wait_status(&mut alice_rx, Some(silent_key), status::DISCONNECTED).await;
    wait_for(&mut alice_rx, |e| *e == CollabEvent::PeerLost { address: silent_key }).await;
    assert!(alice.known_peers().await.is_empty());

    holder.abort();
    alice.shutdown().await;
}

#[tokio::test]
async fn test_new_peer_after_remote_leaves() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, _) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    bob.shutdown().await;
    wait_for(&mut alice_rx, |e| *e == CollabEvent::PeerLost { address: bob_key }).await;
    assert!(alice.known_peers().await.is_empty());

    // Carol dials in; Alice accepts on the same listener.
    let (carol, mut carol_rx) = start("Carol").await;
    let (alice_key, carol_key) = connect_pair(&carol, &mut carol_rx, &alice, &mut alice_rx).await;
    assert_eq!(alice.connection_state(&carol_key).await, Some(ConnectionState::Open));
    assert_eq!(carol.connection_state(&alice_key).await, Some(ConnectionState::Open));
    let names: Vec<String> = alice.known_peers().await.into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Carol".to_string()]);

    alice.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn test_call_requires_open_peer() {
    let (hub, mut rx) = start("Alice").await;
    let stranger: PeerKey = "127.0.0.1:9".parse().unwrap();
    assert_eq!(hub.start_call(stranger).await, Err(CallError::NotConnected));
    wait_status(&mut rx, Some(stranger), "peer is not connected").await;
    assert!(hub.current_call().await.is_none());
    hub.end_call().await;
    hub.shutdown().await;
}

#[tokio::test]
async fn test_call_lifecycle() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, alice_key) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    alice.start_call(bob_key).await.unwrap();
    assert_eq!(alice.start_call(bob_key).await, Err(CallError::Busy));
    wait_status(&mut alice_rx, Some(bob_key), "a call is already in progress").await;
    wait_for(&mut alice_rx, |e| {
        *e == CollabEvent::CallStateChanged {
            address: bob_key,
            state: CallState::Ringing,
        }
    })
    .await;
    wait_for(&mut alice_rx, |e| {
        *e == CollabEvent::CallStateChanged {
            address: bob_key,
            state: CallState::Active,
        }
    })
    .await;

    // Text still flows after renegotiation.
    assert!(alice.send(bob_key, "can you hear me").await);
    wait_for(&mut bob_rx, |e| {
        *e == CollabEvent::MessageReceived {
            address: alice_key,
            text: "can you hear me".into(),
        }
    })
    .await;

    alice.end_call().await;
    wait_for(&mut alice_rx, |e| {
        *e == CollabEvent::CallStateChanged {
            address: bob_key,
            state: CallState::Idle,
        }
    })
    .await;
    assert!(alice.current_call().await.is_none());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_callee_sees_remote_audio_start_and_end() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, alice_key) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    alice.start_call(bob_key).await.unwrap();
    wait_for(&mut alice_rx, |e| {
        *e == CollabEvent::CallStateChanged {
            address: bob_key,
            state: CallState::Active,
        }
    })
    .await;
    wait_status(&mut bob_rx, Some(alice_key), status::RECEIVING_AUDIO).await;
    // The callee has no outgoing call of its own.
    assert!(bob.current_call().await.is_none());

    alice.end_call().await;
    wait_status(&mut bob_rx, Some(alice_key), status::AUDIO_ENDED).await;
    assert_eq!(bob.connection_state(&alice_key).await, Some(ConnectionState::Open));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_call_ends_when_peer_leaves() {
    let (alice, mut alice_rx) = start("Alice").await;
    let (bob, mut bob_rx) = start("Bob").await;
    let (bob_key, _) = connect_pair(&alice, &mut alice_rx, &bob, &mut bob_rx).await;

    alice.start_call(bob_key).await.unwrap();
    wait_for(&mut alice_rx, |e| {
        matches!(e, CollabEvent::CallStateChanged { state: CallState::Active, .. })
    })
    .await;

    bob.shutdown().await;
    wait_for(&mut alice_rx, |e| {
        *e == CollabEvent::CallStateChanged {
            address: bob_key,
            state: CallState::Idle,
        }
    })
    .await;
    assert!(alice.current_call().await.is_none());
    alice.shutdown().await;
}
