//! Relay data plane
//!
//! One task per allocation reads its relay socket and forwards permitted
//! peer traffic to the client. Client traffic leaves from the same socket.
//! Nothing here waits on a full buffer: packets that cannot be handed off
//! immediately are dropped.
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


use crate::allocation::{AllocationTable, ClientTuple, PeerRoute, RelayDirection, RelayRoute, TransportProtocol};
use crate::codec::{Attribute, ChannelData, Message, Method};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const MAX_DATAGRAM: usize = 65_535;

/// Where frames for a client are written
#[derive(Debug, Clone)]
pub enum ClientSink {
    /// Shared listening socket plus the client's address
    Udp {
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
    },
    /// Writer queue of the client's TCP connection
    Tcp(mpsc::Sender<Bytes>),
}

impl ClientSink {
    /// Hand `frame` to the transport without waiting
    pub fn try_deliver(&self, frame: Bytes) -> bool {
        match self {
            ClientSink::Udp { socket, addr } => match socket.try_send_to(&frame, *addr) {
                Ok(_) => true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(client = %addr, "UDP send buffer full, dropping");
                    false
                }
                Err(e) => {
                    debug!(client = %addr, error = %e, "UDP send failed");
                    false
                }
            },
            ClientSink::Tcp(sender) => sender.try_send(frame).is_ok(),
        }
    }

    /// Send a control-plane response, waiting for room if needed
    pub async fn deliver(&self, frame: Bytes) -> io::Result<()> {
        match self {
            ClientSink::Udp { socket, addr } => socket.send_to(&frame, *addr).await.map(|_| ()),
            ClientSink::Tcp(sender) => sender
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer closed")),
        }
    }
}

/// Frame peer data for the client: ChannelData when a channel is bound,
/// otherwise a Data indication
pub fn frame_for_client(route: &RelayRoute, peer: SocketAddr, payload: &[u8]) -> Bytes {
    let padded = route.client.protocol == TransportProtocol::Tcp;
    match route.channel {
        Some(channel) => ChannelData::new(channel, Bytes::copy_from_slice(payload)).encode(padded),
        None => Message::indication(Method::Data)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(Bytes::copy_from_slice(payload)))
            .encode(),
    }
}

struct RelayHandle {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Relay sockets of every live allocation
pub struct RelayPlane {
    table: Arc<AllocationTable>,
    relays: RwLock<HashMap<SocketAddr, RelayHandle>>,
    shutdown: CancellationToken,
}

impl RelayPlane {
    pub fn new(table: Arc<AllocationTable>, shutdown: CancellationToken) -> Self {
        RelayPlane {
            table,
            relays: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Bind `relay_addr` and start forwarding its peer traffic to `sink`
    ///
    /// Returns once the socket is writable, so `send_to_peer` can use it
    /// straight away.
    pub async fn open(&self, relay_addr: SocketAddr, client: ClientTuple, sink: ClientSink) -> io::Result<()> {
        let socket = UdpSocket::bind(relay_addr).await?;
        // try_send_to reports WouldBlock until the reactor has seen the socket
        socket.writable().await?;
        let socket = Arc::new(socket);
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(peer_loop(
            Arc::clone(&socket),
            relay_addr,
            client,
            Arc::clone(&self.table),
            sink,
            cancel.clone(),
        ));
        let previous = self
            .relays
            .write()
            .insert(relay_addr, RelayHandle { socket, cancel, task });
        if let Some(stale) = previous {
            warn!(relay = %relay_addr, "Replacing relay socket still registered");
            stale.cancel.cancel();
        }
        debug!(relay = %relay_addr, client = %client, "Relay socket opened");
        Ok(())
    }

    /// Stop forwarding on `relay_addr` and close its socket
    pub fn close(&self, relay_addr: &SocketAddr) -> bool {
        match self.relays.write().remove(relay_addr) {
            Some(handle) => {
                handle.cancel.cancel();
                debug!(relay = %relay_addr, "Relay socket closed");
                true
            }
            None => false,
        }
    }

    /// Close every relay socket, waiting for the read loops to exit
    pub async fn close_all(&self) {
        let handles: Vec<RelayHandle> = self.relays.write().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.task.await {
                debug!(error = %e, "Relay task ended abnormally");
            }
        }
    }

    /// Send `payload` to the peer from the route's relay socket
    pub fn send_to_peer(&self, route: &PeerRoute, payload: &[u8]) -> bool {
        let relays = self.relays.read();
        let Some(handle) = relays.get(&route.relay_addr) else {
            return false;
        };
        match handle.socket.try_send_to(payload, route.peer) {
            Ok(_) => true,
            Err(e) => {
                trace!(relay = %route.relay_addr, peer = %route.peer, error = %e, "Dropping packet to peer");
                false
            }
        }
    }

    /// Payload of a Send indication from `client`
    pub fn forward_from_client(&self, client: &ClientTuple, peer: SocketAddr, payload: &[u8]) -> bool {
        match self.table.route_to_peer(client, &peer) {
            Ok(route) => {
                let sent = self.send_to_peer(&route, payload);
                if sent {
                    self.table.record_relayed(client, RelayDirection::ToPeer, payload.len());
                }
                sent
            }
            Err(_) => {
                debug!(client = %client, peer = %peer, "No permission for peer, dropping Send");
                false
            }
        }
    }

    /// ChannelData from `client`
    pub fn forward_channel_data(&self, client: &ClientTuple, frame: &ChannelData) -> bool {
        match self.table.route_channel(client, frame.channel) {
            Ok(route) => {
                let sent = self.send_to_peer(&route, &frame.data);
                if sent {
                    self.table.record_relayed(client, RelayDirection::ToPeer, frame.data.len());
                }
                sent
            }
            Err(_) => {
                debug!(client = %client, channel = frame.channel, "Channel not bound, dropping ChannelData");
                false
            }
        }
    }

    pub fn relay_count(&self) -> usize {
        self.relays.read().len()
    }
}

async fn peer_loop(
    socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    client: ClientTuple,
    table: Arc<AllocationTable>,
    sink: ClientSink,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(relay = %relay_addr, client = %client, error = %e, "Relay socket failed");
                    break;
                }
            },
        };

        match table.lookup_by_relay_traffic(&relay_addr, &peer) {
            Ok(route) => {
                let frame = frame_for_client(&route, peer, &buf[..len]);
                if sink.try_deliver(frame) {
                    table.record_relayed(&route.client, RelayDirection::ToClient, len);
                }
            }
            Err(_) => {
                trace!(relay = %relay_addr, peer = %peer, "Peer not permitted, dropping");
            }
        }
    }
}
