//! Shared helpers for the loopback server tests
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(dead_code)]

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iceturn::codec::{
    decode, Attribute, ChannelData, Class, DecodedMessage, Frame, Message, Method, StunFrameCodec,
    TransactionId, PROTOCOL_UDP,
};
use iceturn::long_term_key;
use iceturn_config::{ListenProtocol, TurnConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub const REALM: &str = "pjsip.org";
pub const WAIT: Duration = Duration::from_secs(2);

/// Loopback server config with its own relay port range
pub fn test_config(protocol: ListenProtocol, relay_port_base: u16) -> TurnConfig {
    TurnConfig {
        listen_protocol: protocol,
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        relay_ip: "127.0.0.1".to_string(),
        relay_port_min: relay_port_base,
        relay_port_max: relay_port_base + 199,
        users: "alice:secret,bob:hunter2".to_string(),
        software: "iceturn-test".to_string(),
        shutdown_grace_ms: 500,
        ..TurnConfig::default()
    }
}

/// Long-term credential state of a test client
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub nonce: Option<String>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
            nonce: None,
        }
    }

    pub fn key(&self) -> [u8; 16] {
        long_term_key(&self.username, REALM, &self.password)
    }

    /// Encode `message` signed with the cached nonce
    pub fn sign(&self, message: Message) -> Bytes {
        let nonce = self.nonce.clone().unwrap_or_default();
        message
            .with(Attribute::Username(self.username.clone()))
            .with(Attribute::Realm(REALM.to_string()))
            .with(Attribute::Nonce(nonce))
            .encode_with(Some(&self.key()), true)
    }
}

pub fn allocate_request() -> Message {
    Message::request(Method::Allocate)
        .with(Attribute::RequestedTransport(PROTOCOL_UDP))
        .with(Attribute::Lifetime(600))
}

pub fn permission_request(peer: SocketAddr) -> Message {
    Message::request(Method::CreatePermission).with(Attribute::XorPeerAddress(peer))
}

pub fn channel_bind_request(channel: u16, peer: SocketAddr) -> Message {
    Message::request(Method::ChannelBind)
        .with(Attribute::ChannelNumber(channel))
        .with(Attribute::XorPeerAddress(peer))
}

pub fn refresh_request(lifetime: u32) -> Message {
    Message::request(Method::Refresh).with(Attribute::Lifetime(lifetime))
}

pub fn send_indication(peer: SocketAddr, data: &[u8]) -> Message {
    Message::new(Method::Send, Class::Indication, TransactionId::random())
        .with(Attribute::XorPeerAddress(peer))
        .with(Attribute::Data(Bytes::copy_from_slice(data)))
}

/// TURN client over UDP
pub struct UdpClient {
    pub socket: UdpSocket,
    pub server: SocketAddr,
    pub credentials: Credentials,
}

impl UdpClient {
    pub async fn connect(server: SocketAddr, username: &str, password: &str) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        UdpClient {
            socket,
            server,
            credentials: Credentials::new(username, password),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send_raw(&self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.server).await.unwrap();
    }

    /// Next datagram from the server, if one arrives within `wait`
    pub async fn recv_raw(&self, wait: Duration) -> Option<Bytes> {
        let mut buf = vec![0u8; 65_535];
        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(Bytes::copy_from_slice(&buf[..len])),
            _ => None,
        }
    }

    /// Send `bytes` and wait for the response to `transaction_id`
    pub async fn transact(&self, bytes: &[u8], transaction_id: TransactionId) -> DecodedMessage {
        self.send_raw(bytes).await;
        loop {
            let raw = self.recv_raw(WAIT).await.expect("no response from server");
            if let Ok((decoded, _)) = decode(&raw) {
                if decoded.message.transaction_id == transaction_id {
                    return decoded;
                }
            }
        }
    }

    /// Send unsigned and expect a 401 carrying a nonce
    pub async fn challenge(&mut self, message: Message) -> DecodedMessage {
        let transaction_id = message.transaction_id;
        let response = self.transact(&message.encode(), transaction_id).await;
        if let Some(nonce) = response.message.nonce() {
            self.credentials.nonce = Some(nonce.to_string());
        }
        response
    }

    /// Signed request, fetching a nonce first if needed
    pub async fn request(&mut self, message: Message) -> DecodedMessage {
        if self.credentials.nonce.is_none() {
            self.challenge(Message::request(Method::Refresh)).await;
        }
        let transaction_id = message.transaction_id;
        let bytes = self.credentials.sign(message);
        self.transact(&bytes, transaction_id).await
    }

    /// Allocate and return the relayed address
    pub async fn allocate(&mut self) -> SocketAddr {
        let response = self.request(allocate_request()).await;
        assert_eq!(
            response.message.class,
            Class::SuccessResponse,
            "allocate failed: {:?}",
            response.message.error_code()
        );
        response.message.xor_relayed_address().unwrap()
    }
}

/// TURN client over a framed TCP stream
pub struct TcpClient {
    pub framed: Framed<TcpStream, StunFrameCodec>,
    pub credentials: Credentials,
}

impl TcpClient {
    pub async fn connect(server: SocketAddr, username: &str, password: &str) -> Self {
        let stream = TcpStream::connect(server).await.unwrap();
        TcpClient {
            framed: Framed::new(stream, StunFrameCodec::new()),
            credentials: Credentials::new(username, password),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.framed.get_ref().local_addr().unwrap()
    }

    pub async fn send_raw(&mut self, bytes: Bytes) {
        self.framed.send(bytes).await.unwrap();
    }

    pub async fn next_frame(&mut self, wait: Duration) -> Option<Frame> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            _ => None,
        }
    }

    pub async fn transact(&mut self, bytes: Bytes, transaction_id: TransactionId) -> DecodedMessage {
        self.send_raw(bytes).await;
        loop {
            match self.next_frame(WAIT).await.expect("no response from server") {
                Frame::Stun(raw) => {
                    let (decoded, _) = decode(&raw).unwrap();
                    if decoded.message.transaction_id == transaction_id {
                        return decoded;
                    }
                }
                Frame::ChannelData(_) => {}
            }
        }
    }

    pub async fn request(&mut self, message: Message) -> DecodedMessage {
        if self.credentials.nonce.is_none() {
            let unsigned = Message::request(Method::Refresh);
            let transaction_id = unsigned.transaction_id;
            let response = self.transact(unsigned.encode(), transaction_id).await;
            self.credentials.nonce = response.message.nonce().map(str::to_string);
        }
        let transaction_id = message.transaction_id;
        let bytes = self.credentials.sign(message);
        self.transact(bytes, transaction_id).await
    }

    pub async fn allocate(&mut self) -> SocketAddr {
        let response = self.request(allocate_request()).await;
        assert_eq!(response.message.class, Class::SuccessResponse);
        response.message.xor_relayed_address().unwrap()
    }

    pub async fn send_channel_data(&mut self, channel: u16, data: &[u8]) {
        let frame = ChannelData::new(channel, Bytes::copy_from_slice(data)).encode(true);
        self.send_raw(frame).await;
    }
}

/// A plain UDP socket standing in for a remote peer
pub async fn peer_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

pub async fn peer_recv(peer: &UdpSocket, wait: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 65_535];
    match timeout(wait, peer.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
        _ => None,
    }
}
