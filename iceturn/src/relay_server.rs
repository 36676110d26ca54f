//! TURN relay server
//!
//! Owns the listening sockets and the task layout around the handler:
//! one read loop per socket, a pool of control-plane workers fed by
//! bounded queues sharded by client tuple, and a periodic expiry sweep.
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


use crate::allocation::{AllocationTable, ClientTuple, TableLimits, TransportProtocol};
use crate::auth::{Authenticator, CredentialStore, StaticCredentials};
use crate::codec::{classify, ChannelData, Frame, PacketKind, StunFrameCodec};
use crate::error::{RelayError, RelayResult};
use crate::events::{AllocationEvent, EventBus};
use crate::relay::{ClientSink, RelayPlane};
use crate::stun_turn_handler::StunTurnHandler;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iceturn_config::{ConfigError, ListenProtocol, TurnConfig};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How long a TCP read loop waits for queue space before dropping
pub const TCP_SUBMIT_TIMEOUT: Duration = Duration::from_millis(50);

const MAX_DATAGRAM: usize = 65_535;

/// Pause after a socket error, doubled per consecutive failure
const ERROR_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

enum WorkItem {
    Message {
        raw: Bytes,
        client: ClientTuple,
        sink: ClientSink,
    },
    Disconnected(ClientTuple),
}

/// Bounded queues, one per worker; a client always lands on the same one
struct WorkQueues {
    senders: Vec<mpsc::Sender<WorkItem>>,
}

impl WorkQueues {
    fn new(workers: usize, depth: usize) -> (Self, Vec<mpsc::Receiver<WorkItem>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers).map(|_| mpsc::channel(depth)).unzip();
        (WorkQueues { senders }, receivers)
    }

    fn shard(&self, client: &ClientTuple) -> &mpsc::Sender<WorkItem> {
        let mut hasher = DefaultHasher::new();
        client.hash(&mut hasher);
        &self.senders[(hasher.finish() % self.senders.len() as u64) as usize]
    }

    fn try_submit(&self, client: &ClientTuple, item: WorkItem) -> bool {
        self.shard(client).try_send(item).is_ok()
    }

    async fn submit_within(&self, client: &ClientTuple, item: WorkItem, timeout: Duration) -> bool {
        self.shard(client).send_timeout(item, timeout).await.is_ok()
    }

    async fn submit(&self, client: &ClientTuple, item: WorkItem) -> bool {
        self.shard(client).send(item).await.is_ok()
    }
}

/// Relay server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Open TCP control connections
    pub active_connections: usize,
    /// Active allocations
    pub active_allocations: usize,
    /// Installed permissions across allocations
    pub permissions: usize,
    /// Channel bindings across allocations
    pub channels: usize,
    /// Open relay sockets
    pub relay_sockets: usize,
    /// Bytes relayed client to peer
    pub bytes_to_peer: u64,
    /// Bytes relayed peer to client
    pub bytes_to_client: u64,
}

/// TURN server
pub struct TurnServer {
    handler: Arc<StunTurnHandler>,
    shutdown: CancellationToken,
    queues: Option<Arc<WorkQueues>>,
    io_tasks: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    udp_addr: SocketAddr,
    tcp_addr: Option<SocketAddr>,
    connections: Arc<AtomicUsize>,
    grace: Duration,
}

impl TurnServer {
    /// Start with the users from the `users` setting
    pub async fn start(config: TurnConfig) -> RelayResult<Self> {
        let store = StaticCredentials::from_config(&config)?;
        Self::start_with_store(config, Arc::new(store)).await
    }

    /// Start with an external credential store
    pub async fn start_with_store(config: TurnConfig, store: Arc<dyn CredentialStore>) -> RelayResult<Self> {
        config.validate()?;
        let limits = TableLimits::from_config(&config)?;
        let advertised_ip: IpAddr = config.advertised_ip().parse().map_err(|_| ConfigError::Invalid {
            key: "external_ip",
            reason: format!("'{}' is not an IP address", config.advertised_ip()),
        })?;

        let listen_addr = config.listen_addr();
        let udp_socket = UdpSocket::bind(&listen_addr)
            .await
            .map_err(|e| RelayError::NetworkError(format!("Failed to bind UDP {}: {}", listen_addr, e)))?;
        let udp_addr = udp_socket
            .local_addr()
            .map_err(|e| RelayError::NetworkError(e.to_string()))?;
        // Relayed data to UDP clients goes out through try_send_to
        udp_socket
            .writable()
            .await
            .map_err(|e| RelayError::NetworkError(e.to_string()))?;

        let tcp_listener = match config.listen_protocol {
            ListenProtocol::Udp => None,
            ListenProtocol::Tcp => {
                // Same port as UDP, which matters when the configured port is 0
                let tcp_bind = SocketAddr::new(udp_addr.ip(), udp_addr.port());
                let listener = TcpListener::bind(tcp_bind)
                    .await
                    .map_err(|e| RelayError::NetworkError(format!("Failed to bind TCP {}: {}", tcp_bind, e)))?;
                Some(listener)
            }
        };
        let tcp_addr = match &tcp_listener {
            Some(listener) => Some(
                listener
                    .local_addr()
                    .map_err(|e| RelayError::NetworkError(e.to_string()))?,
            ),
            None => None,
        };

        let shutdown = CancellationToken::new();
        let table = Arc::new(AllocationTable::new(limits));
        let relay = Arc::new(RelayPlane::new(Arc::clone(&table), shutdown.child_token()));
        let auth = Authenticator::new(config.realm.clone(), store, config.nonce_lifetime());
        let software = Some(config.software.clone());
        let handler = Arc::new(StunTurnHandler::new(
            table,
            relay,
            auth,
            EventBus::default(),
            advertised_ip,
            software,
        ));

        let (queues, receivers) = WorkQueues::new(config.worker_count, config.queue_depth);
        let queues = Arc::new(queues);
        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(id, receiver)| tokio::spawn(worker_loop(id, receiver, Arc::clone(&handler))))
            .collect();

        let connections = Arc::new(AtomicUsize::new(0));
        let mut io_tasks = vec![tokio::spawn(udp_loop(
            Arc::new(udp_socket),
            Arc::clone(&handler),
            Arc::clone(&queues),
            shutdown.clone(),
        ))];
        if let Some(listener) = tcp_listener {
            io_tasks.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&handler),
                Arc::clone(&queues),
                shutdown.clone(),
                config.queue_depth,
                Arc::clone(&connections),
            )));
        }
        io_tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&handler),
            config.sweep_interval(),
            shutdown.clone(),
        )));

        info!(
            udp = %udp_addr,
            tcp = ?tcp_addr,
            realm = %config.realm,
            workers = config.worker_count,
            relay_ports = %format!("{}-{}", config.relay_port_min, config.relay_port_max),
            "TURN server started"
        );

        Ok(TurnServer {
            handler,
            shutdown,
            queues: Some(queues),
            io_tasks,
            workers,
            udp_addr,
            tcp_addr,
            connections,
            grace: config.shutdown_grace(),
        })
    }

    /// Stop reading, let workers drain within the grace period, then
    /// delete every allocation and close relay sockets
    pub async fn stop(&mut self) {
        if self.queues.is_none() {
            return;
        }
        info!(udp = %self.udp_addr, "Stopping TURN server");
        self.shutdown.cancel();
        for task in self.io_tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "I/O task ended abnormally");
            }
        }

        // Read loops are gone; dropping the last sender lets workers finish
        self.queues = None;
        let workers: Vec<JoinHandle<()>> = self.workers.drain(..).collect();
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(self.grace, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        }

        let deleted = self.handler.shutdown().await;
        info!(allocations = deleted, "TURN server stopped");
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Allocation events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AllocationEvent> {
        self.handler.events().subscribe()
    }

    /// Get server statistics
    pub fn stats(&self) -> RelayStats {
        let table = self.handler.table().stats();
        RelayStats {
            active_connections: self.connections.load(Ordering::Relaxed),
            active_allocations: table.allocations,
            permissions: table.permissions,
            channels: table.channels,
            relay_sockets: self.handler.relay().relay_count(),
            bytes_to_peer: table.bytes_to_peer,
            bytes_to_client: table.bytes_to_client,
        }
    }
}

impl Drop for TurnServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(id: usize, mut receiver: mpsc::Receiver<WorkItem>, handler: Arc<StunTurnHandler>) {
    while let Some(item) = receiver.recv().await {
        match item {
            WorkItem::Message { raw, client, sink } => {
                if let Some(response) = handler.handle_message(&raw, client, &sink).await {
                    if let Err(e) = sink.deliver(response).await {
                        debug!(worker = id, client = %client, error = %e, "Failed to send response");
                    }
                }
            }
            WorkItem::Disconnected(client) => handler.client_disconnected(&client),
        }
    }
    trace!(worker = id, "Worker exiting");
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<StunTurnHandler>,
    queues: Arc<WorkQueues>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut backoff = ERROR_BACKOFF_MIN;
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "UDP receive failed");
                    if !back_off(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };
        backoff = ERROR_BACKOFF_MIN;

        let client = ClientTuple::new(from, TransportProtocol::Udp);
        let packet = &buf[..len];
        match classify(packet) {
            PacketKind::Stun => {
                let item = WorkItem::Message {
                    raw: Bytes::copy_from_slice(packet),
                    client,
                    sink: ClientSink::Udp {
                        socket: Arc::clone(&socket),
                        addr: from,
                    },
                };
                if !queues.try_submit(&client, item) {
                    debug!(client = %client, "Work queue full, dropping datagram");
                }
            }
            PacketKind::ChannelData => match ChannelData::decode(packet, false) {
                Ok((frame, _)) => handler.handle_channel_data(&frame, &client),
                Err(e) => trace!(client = %client, error = %e, "Bad ChannelData"),
            },
            PacketKind::Unknown => trace!(client = %client, "Unrecognized datagram"),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<StunTurnHandler>,
    queues: Arc<WorkQueues>,
    shutdown: CancellationToken,
    depth: usize,
    connections: Arc<AtomicUsize>,
) {
    let mut backoff = ERROR_BACKOFF_MIN;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "TCP accept failed");
                    if !back_off(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            },
        };
        backoff = ERROR_BACKOFF_MIN;
        debug!(client = %peer, "TCP connection accepted");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        connections.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::clone(&handler);
        let queues = Arc::clone(&queues);
        let shutdown = shutdown.clone();
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            tcp_connection(stream, peer, handler, queues, shutdown, depth).await;
            connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn tcp_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<StunTurnHandler>,
    queues: Arc<WorkQueues>,
    shutdown: CancellationToken,
    depth: usize,
) {
    let client = ClientTuple::new(peer, TransportProtocol::Tcp);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, StunFrameCodec::new());
    let mut writer = FramedWrite::new(write_half, StunFrameCodec::new());

    let (tx, mut rx) = mpsc::channel::<Bytes>(depth);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                debug!(client = %peer, error = %e, "TCP write failed");
                break;
            }
        }
    });
    let sink = ClientSink::Tcp(tx);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Stun(raw))) => {
                let item = WorkItem::Message {
                    raw,
                    client,
                    sink: sink.clone(),
                };
                if !queues.submit_within(&client, item, TCP_SUBMIT_TIMEOUT).await {
                    debug!(client = %client, "Work queue full, dropping TCP message");
                }
            }
            Some(Ok(Frame::ChannelData(frame))) => handler.handle_channel_data(&frame, &client),
            Some(Err(e)) => {
                debug!(client = %client, error = %e, "Closing TCP connection on framing error");
                break;
            }
            None => break,
        }
    }

    // Queued behind this client's pending requests
    if !shutdown.is_cancelled() && !queues.submit(&client, WorkItem::Disconnected(client)).await {
        handler.client_disconnected(&client);
    }
    drop(sink);
    writer_task.abort();
    debug!(client = %client, "TCP connection closed");
}

/// Wait out `delay` and double it; false when shutdown came first
async fn back_off(delay: &mut Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => return false,
        _ = tokio::time::sleep(*delay) => {}
    }
    *delay = (*delay * 2).min(ERROR_BACKOFF_MAX);
    true
}

async fn sweep_loop(handler: Arc<StunTurnHandler>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                handler.sweep_expired();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(protocol: ListenProtocol) -> TurnConfig {
        TurnConfig {
            listen_protocol: protocol,
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            relay_ip: "127.0.0.1".to_string(),
            relay_port_min: 43000,
            relay_port_max: 43999,
            users: "alice:secret".to_string(),
            shutdown_grace_ms: 200,
            ..TurnConfig::default()
        }
    }

    #[test]
    fn test_sharding_is_stable() {
        let (queues, _receivers) = WorkQueues::new(4, 8);
        let client = ClientTuple::new("127.0.0.1:5000".parse().unwrap(), TransportProtocol::Udp);
        let first = queues.shard(&client) as *const _;
        let second = queues.shard(&client) as *const _;
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_backoff_doubles_and_caps() {
        let shutdown = CancellationToken::new();
        let mut delay = ERROR_BACKOFF_MIN;
        let start = tokio::time::Instant::now();

        assert!(back_off(&mut delay, &shutdown).await);
        assert!(start.elapsed() >= ERROR_BACKOFF_MIN);
        assert_eq!(delay, ERROR_BACKOFF_MIN * 2);

        for _ in 0..10 {
            assert!(back_off(&mut delay, &shutdown).await);
        }
        assert_eq!(delay, ERROR_BACKOFF_MAX);

        shutdown.cancel();
        let before = tokio::time::Instant::now();
        assert!(!back_off(&mut delay, &shutdown).await);
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_start_and_stop_udp() {
        let mut server = TurnServer::start(test_config(ListenProtocol::Udp)).await.unwrap();
        assert_ne!(server.local_udp_addr().port(), 0);
        assert!(server.local_tcp_addr().is_none());
        assert_eq!(server.stats(), RelayStats::default());
        server.stop().await;
        // Second stop is a no-op
        server.stop().await;
    }

    #[tokio::test]
    async fn test_tcp_shares_udp_port() {
        let mut server = TurnServer::start(test_config(ListenProtocol::Tcp)).await.unwrap();
        assert_eq!(server.local_tcp_addr().map(|a| a.port()), Some(server.local_udp_addr().port()));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_relay_ip_is_config_error() {
        let mut config = test_config(ListenProtocol::Udp);
        config.relay_ip = "not-an-ip".to_string();
        assert!(matches!(
            TurnServer::start(config).await,
            Err(RelayError::Config(_))
        ));
    }
}
