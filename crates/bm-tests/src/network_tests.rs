//! Multi-node scenarios over localhost TCP.

use crate::generators::{local_address, msg_object, msg_object_with_ttl};
use crate::harness::{link, test_network_config, wait_until, within, TestNode, SETTLE_TIMEOUT};
use bm_core::{
    Inventory, NetworkAddress, NodeRegistry, Sha512Cryptography, NODE_NETWORK_SERVICE,
    PROTOCOL_VERSION,
};
use bm_network::{
    CustomCommandHandler, CustomMessage, Message, MessageCodec, NetworkConfig, NetworkError,
    VersionMessage,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

struct Upper;

impl CustomCommandHandler for Upper {
    fn handle(&self, request: CustomMessage) -> Option<CustomMessage> {
        let text = String::from_utf8_lossy(&request.data).to_uppercase();
        Some(CustomMessage::new(request.command, text.into_bytes()))
    }
}

fn knows(node: &TestNode, addr: SocketAddr) -> bool {
    node.registry
        .known_addresses(1000, &[1])
        .iter()
        .any(|a| a.socket_addr() == addr)
}

fn raw_version(nonce: u64, version: i32, to: SocketAddr) -> Message {
    Message::Version(VersionMessage {
        version,
        services: NODE_NETWORK_SERVICE,
        timestamp: bm_core::unix_now(),
        addr_recv: NetworkAddress::from_socket_addr(to, 0, NODE_NETWORK_SERVICE, 0),
        addr_from: local_address(0, 0),
        nonce,
        user_agent: "/raw-peer/".to_string(),
        streams: vec![1],
    })
}

async fn next_message(framed: &mut Framed<TcpStream, MessageCodec>) -> Option<Message> {
    tokio::time::timeout(SETTLE_TIMEOUT, framed.next())
        .await
        .expect("peer went silent")
        .map(|r| r.expect("valid frame"))
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_two_nodes_complete_handshake() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    link(&b, &a).await;

    let status = b.status();
    assert_eq!(status.connections.active, 1);
    assert_eq!(status.by_stream.get(&1).map(|c| c.active), Some(1));
    let peer = &status.peers[0];
    assert_eq!(peer.addr, a.addr);
    assert_eq!(peer.version, Some(PROTOCOL_VERSION));
    assert_eq!(peer.streams, vec![1]);
    assert!(peer.outbound());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_handshake_records_listening_endpoints() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    link(&b, &a).await;

    // The server learns the client's listen port from its version message,
    // the client learns the address it dialed.
    assert!(wait_until(SETTLE_TIMEOUT, || knows(&a, b.addr)).await);
    assert!(wait_until(SETTLE_TIMEOUT, || knows(&b, a.addr)).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_known_addresses_are_shared_on_activation() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let rumoured = SocketAddr::from(([127, 0, 0, 1], 40001));
    a.registry.offer_addresses(vec![local_address(rumoured.port(), 1)]);

    link(&b, &a).await;
    assert!(wait_until(SETTLE_TIMEOUT, || knows(&b, rumoured)).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_self_connection_is_dropped() {
    let a = TestNode::start().await;

    a.service.connect(a.addr);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(wait_until(SETTLE_TIMEOUT, || a.status().peers.is_empty()).await);
    assert_eq!(a.active_connections(), 0);

    a.stop().await;
}

#[tokio::test]
async fn test_old_protocol_version_is_refused() {
    let a = TestNode::start().await;
    let stream = TcpStream::connect(a.addr).await.unwrap();
    let mut framed = Framed::new(stream, MessageCodec::default());

    framed
        .send(raw_version(7, PROTOCOL_VERSION - 1, a.addr))
        .await
        .unwrap();

    // No verack; the server just hangs up.
    assert_eq!(next_message(&mut framed).await, None);
    assert_eq!(a.active_connections(), 0);

    a.stop().await;
}

#[tokio::test]
async fn test_raw_peer_handshake_and_object_request() {
    let a = TestNode::start().await;
    let stream = TcpStream::connect(a.addr).await.unwrap();
    let mut framed = Framed::new(stream, MessageCodec::default());

    framed.send(raw_version(42, PROTOCOL_VERSION, a.addr)).await.unwrap();
    assert_eq!(next_message(&mut framed).await, Some(Message::Verack));
    match next_message(&mut framed).await {
        Some(Message::Version(version)) => {
            assert_eq!(version.nonce, a.service.client_nonce());
            assert_eq!(version.streams, vec![1]);
        }
        other => panic!("expected version, got {:?}", other),
    }
    framed.send(Message::Verack).await.unwrap();
    assert!(wait_until(SETTLE_TIMEOUT, || a.active_connections() == 1).await);

    // Offer an object; the node must ask for it and store it.
    let object = a.mine(msg_object(1));
    let iv = object.inventory_vector(&Sha512Cryptography).unwrap();
    framed.send(Message::Inv(vec![iv])).await.unwrap();
    loop {
        match next_message(&mut framed).await {
            Some(Message::GetData(requested)) => {
                assert_eq!(requested, vec![iv]);
                break;
            }
            Some(_) => continue,
            None => panic!("connection closed before getdata"),
        }
    }
    framed.send(Message::Object(object)).await.unwrap();
    a.assert_receives(iv).await;
    assert!(wait_until(SETTLE_TIMEOUT, || a.status().outstanding_requests == 0).await);

    a.stop().await;
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn test_published_object_reaches_peer() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    link(&b, &a).await;

    let iv = a.publish(msg_object(1));
    b.assert_receives(iv).await;
    assert!(wait_until(SETTLE_TIMEOUT, || b.status().outstanding_requests == 0).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_late_joiner_receives_existing_inventory() {
    let a = TestNode::start().await;
    let ivs: Vec<_> = (0..5).map(|_| a.publish(msg_object(1))).collect();

    let b = TestNode::start().await;
    link(&b, &a).await;

    for iv in ivs {
        b.assert_receives(iv).await;
    }
    assert_eq!(b.inventory.len(), 5);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_objects_relay_across_a_chain() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    let c = TestNode::start().await;
    link(&b, &a).await;
    link(&c, &b).await;

    let from_a = a.publish(msg_object(1));
    c.assert_receives(from_a).await;

    let from_c = c.publish(msg_object(1));
    a.assert_receives(from_c).await;

    for node in [&a, &b, &c] {
        assert_eq!(node.inventory.len(), 2);
    }

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_objects_of_other_streams_stay_local() {
    let a = TestNode::start_with(
        NetworkConfig {
            streams: vec![1, 2],
            ..test_network_config()
        },
        None,
    )
    .await;
    let b = TestNode::start().await;
    link(&b, &a).await;

    let foreign = a.publish(msg_object(2));
    let shared = a.publish(msg_object(1));
    b.assert_receives(shared).await;

    // Give a stray offer time to arrive before checking it did not.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!b.has(&foreign));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_stopping_a_node_disconnects_peers() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    link(&b, &a).await;

    a.stop().await;
    assert!(wait_until(SETTLE_TIMEOUT, || b.status().peers.is_empty()).await);

    b.stop().await;
}

// ============================================================================
// Synchronization
// ============================================================================

#[tokio::test]
async fn test_sync_fetches_everything_missing() {
    let a = TestNode::start().await;
    for _ in 0..3 {
        a.publish(msg_object(1));
    }
    let b = TestNode::start().await;
    let already = a.publish(msg_object(1));
    let copy = a.inventory.get(&already).unwrap();
    b.inventory.store(already, copy);

    let received = within(b.service.synchronize(a.addr, Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(received, 3);
    assert_eq!(b.inventory.len(), 4);

    // The session ends by itself and does not stay in the pool.
    assert!(wait_until(SETTLE_TIMEOUT, || b.status().peers.is_empty()).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_sync_with_empty_peer_returns_zero() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    let received = within(b.service.synchronize(a.addr, Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(received, 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_sync_with_silent_peer_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = listener.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let b = TestNode::start().await;
    let result = within(b.service.synchronize(silent, Duration::from_millis(300))).await;
    assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));

    holder.abort();
    b.stop().await;
}

// ============================================================================
// Custom Requests
// ============================================================================

#[tokio::test]
async fn test_custom_request_is_answered() {
    let a = TestNode::start_with_handler(Arc::new(Upper)).await;
    let b = TestNode::start().await;

    let response = b
        .service
        .send_request(
            a.addr,
            CustomMessage::new("shout", &b"quiet please"[..]),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.command, "shout");
    assert_eq!(&response.data[..], b"QUIET PLEASE");

    // The serving connection closes after the response.
    assert!(wait_until(SETTLE_TIMEOUT, || a.status().peers.is_empty()).await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_custom_request_without_handler_is_refused() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    let result = b
        .service
        .send_request(
            a.addr,
            CustomMessage::new("shout", &b"hello"[..]),
            Duration::from_secs(5),
        )
        .await;
    assert!(result.is_err());

    a.stop().await;
    b.stop().await;
}

// ============================================================================
// Publishing
// ============================================================================

#[tokio::test]
async fn test_publish_rejects_invalid_objects() {
    let a = TestNode::start().await;

    // No nonce.
    assert!(a.service.publish(msg_object(1)).is_err());
    // Stream not served.
    assert!(a.service.publish(a.mine(msg_object(7))).is_err());
    // Expired long ago.
    let stale = a.mine(msg_object_with_ttl(1, -24 * 60 * 60));
    assert!(a.service.publish(stale).is_err());

    assert!(a.inventory.is_empty());
    a.stop().await;
}

#[tokio::test]
async fn test_publishing_twice_is_harmless() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;
    link(&b, &a).await;

    let object = a.mine(msg_object(1));
    let first = a.service.publish(object.clone()).unwrap();
    let second = a.service.publish(object).unwrap();
    assert_eq!(first, second);
    assert_eq!(a.inventory.len(), 1);

    b.assert_receives(first).await;
    assert_eq!(b.inventory.len(), 1);

    a.stop().await;
    b.stop().await;
}
