//! Load Tests for the iceturn relay
//!
//! These tests drive a loopback server with many concurrent clients:
//! - Concurrent allocations from distinct client tuples
//! - Concurrent relayed traffic through those allocations
//!
//! Run with: cargo test --test load_test --release

use bytes::Bytes;
use futures::future::join_all;
use iceturn::codec::{decode, Attribute, Class, Message, Method, PROTOCOL_UDP};
use iceturn::{listen_with, long_term_key, Listener};
use iceturn_config::{ListenProtocol, TurnConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const REALM: &str = "pjsip.org";
const CLIENTS: usize = 100;

async fn start_server(relay_port_base: u16) -> Listener {
    let config = TurnConfig {
        listen_protocol: ListenProtocol::Udp,
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        relay_ip: "127.0.0.1".to_string(),
        relay_port_min: relay_port_base,
        relay_port_max: relay_port_base + 499,
        users: "loadtest:loadtest".to_string(),
        worker_count: 8,
        user_quota: 1000,
        ip_quota: 1000,
        ..TurnConfig::default()
    };
    listen_with(config).await.expect("Failed to start server")
}

/// Send `message` and wait for the response with the same transaction id
async fn transact(socket: &UdpSocket, server: SocketAddr, bytes: &[u8], message: &Message) -> Message {
    socket.send_to(bytes, server).await.expect("send failed");
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("Timed out waiting for response")
            .expect("recv failed");
        if let Ok((decoded, _)) = decode(&buf[..len]) {
            if decoded.message.transaction_id == message.transaction_id {
                return decoded.message;
            }
        }
    }
}

/// Run the 401 handshake and Allocate; returns the socket, relayed address and nonce
async fn allocate(server: SocketAddr) -> (UdpSocket, SocketAddr, String) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");

    let unsigned = Message::request(Method::Allocate).with(Attribute::RequestedTransport(PROTOCOL_UDP));
    let challenge = transact(&socket, server, &unsigned.encode(), &unsigned).await;
    assert_eq!(challenge.error_code().map(|e| e.code), Some(401));
    let nonce = challenge.nonce().expect("challenge without nonce").to_string();

    let request = Message::request(Method::Allocate)
        .with(Attribute::RequestedTransport(PROTOCOL_UDP))
        .with(Attribute::Username("loadtest".to_string()))
        .with(Attribute::Realm(REALM.to_string()))
        .with(Attribute::Nonce(nonce.clone()));
    let key = long_term_key("loadtest", REALM, "loadtest");
    let response = transact(&socket, server, &request.encode_with(Some(&key[..]), true), &request).await;
    assert_eq!(response.class, Class::SuccessResponse, "{:?}", response.error_code());
    let relayed = response.xor_relayed_address().expect("no relayed address");
    (socket, relayed, nonce)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations() {
    let listener = start_server(47000).await;
    let server = listener.server().local_udp_addr();

    let start = Instant::now();
    let handles: Vec<_> = (0..CLIENTS).map(|_| tokio::spawn(allocate(server))).collect();
    let results = join_all(handles).await;
    let elapsed = start.elapsed();

    let relayed: HashSet<SocketAddr> = results
        .into_iter()
        .map(|r| r.expect("client task panicked").1)
        .collect();

    println!("✅ {} allocations in {:?}", CLIENTS, elapsed);
    assert_eq!(relayed.len(), CLIENTS, "relay addresses must be unique");
    assert_eq!(listener.stats().active_allocations, CLIENTS);

    listener.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_relayed_traffic() {
    let listener = start_server(47600).await;
    let server = listener.server().local_udp_addr();
    let peer = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
    let peer_addr = peer.local_addr().expect("peer addr");
    let key = long_term_key("loadtest", REALM, "loadtest");

    let clients = join_all((0..20).map(|_| allocate(server))).await;

    // Each client permits the peer and sends one Send indication
    for (socket, _, nonce) in &clients {
        let request = Message::request(Method::CreatePermission)
            .with(Attribute::XorPeerAddress(peer_addr))
            .with(Attribute::Username("loadtest".to_string()))
            .with(Attribute::Realm(REALM.to_string()))
            .with(Attribute::Nonce(nonce.clone()));
        let response = transact(socket, server, &request.encode_with(Some(&key[..]), true), &request).await;
        assert_eq!(response.class, Class::SuccessResponse);

        let send = Message::indication(Method::Send)
            .with(Attribute::XorPeerAddress(peer_addr))
            .with(Attribute::Data(Bytes::from_static(b"ping")));
        socket.send_to(&send.encode(), server).await.expect("send failed");
    }

    let mut sources = HashSet::new();
    let mut buf = [0u8; 64];
    while sources.len() < clients.len() {
        let (len, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .expect("Timed out waiting for relayed data")
            .expect("recv failed");
        assert_eq!(&buf[..len], b"ping");
        sources.insert(from);
    }

    let relays: HashSet<SocketAddr> = clients.iter().map(|(_, relayed, _)| *relayed).collect();
    assert_eq!(sources, relays);
    assert_eq!(listener.stats().bytes_to_peer, 4 * clients.len() as u64);

    listener.close().await;
}
