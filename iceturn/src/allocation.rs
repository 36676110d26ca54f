//! TURN allocation management
//!
//! The table owns every allocation together with its permissions and
//! channel bindings. Mutations take the write lock; the relay path only
//! takes read locks. Callers get snapshots or routing answers, never
//! references into the table.
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


use crate::codec::is_valid_channel;
use crate::error::AllocError;
use crate::port_pool::PortPool;
use iceturn_config::{ConfigError, TurnConfig};
use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Transport between client and server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "udp"),
            TransportProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Client address plus the transport it reached us over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientTuple {
    /// Client source address
    pub addr: SocketAddr,
    /// Client transport
    pub protocol: TransportProtocol,
}

impl ClientTuple {
    pub fn new(addr: SocketAddr, protocol: TransportProtocol) -> Self {
        ClientTuple { addr, protocol }
    }
}

impl fmt::Display for ClientTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.protocol)
    }
}

/// Channel number aliasing a peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Channel number (0x4000..=0x7FFF)
    pub channel: u16,
    /// Bound peer
    pub peer: SocketAddr,
    /// Expiry deadline
    pub expires_at: Instant,
}

/// Direction of relayed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ToPeer,
    ToClient,
}

struct Allocation {
    id: Uuid,
    client: ClientTuple,
    relay_addr: SocketAddr,
    username: String,
    realm: String,
    requested_transport: u8,
    lifetime: Duration,
    created_at: Instant,
    expires_at: Instant,
    permissions: HashMap<IpAddr, Instant>,
    channels: HashMap<u16, ChannelBinding>,
    peer_channels: HashMap<SocketAddr, u16>,
    bytes_to_peer: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl Allocation {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn is_permitted(&self, peer: IpAddr, now: Instant) -> bool {
        self.permissions
            .get(&peer)
            .map_or(false, |expires_at| *expires_at > now)
    }

    fn live_channel_for(&self, peer: &SocketAddr, now: Instant) -> Option<u16> {
        let channel = *self.peer_channels.get(peer)?;
        self.channels
            .get(&channel)
            .filter(|binding| binding.expires_at > now)
            .map(|binding| binding.channel)
    }

    fn ensure_owner(&self, username: &str) -> Result<(), AllocError> {
        if self.username == username {
            Ok(())
        } else {
            Err(AllocError::WrongOwner)
        }
    }

    fn snapshot(&self) -> AllocationInfo {
        AllocationInfo {
            allocation_id: self.id,
            client: self.client,
            relay_addr: self.relay_addr,
            username: self.username.clone(),
            realm: self.realm.clone(),
            requested_transport: self.requested_transport,
            lifetime: self.lifetime,
            created_at: self.created_at,
            expires_at: self.expires_at,
            permissions: self.permissions.keys().copied().collect(),
            channels: self.channels.values().copied().collect(),
            bytes_to_peer: self.bytes_to_peer.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    /// Drop permissions and bindings past their deadline
    fn prune(&mut self, now: Instant) -> (usize, usize) {
        let permissions_before = self.permissions.len();
        self.permissions.retain(|_, expires_at| *expires_at > now);

        let channels_before = self.channels.len();
        self.channels.retain(|_, binding| binding.expires_at > now);
        let channels = &self.channels;
        self.peer_channels
            .retain(|_, channel| channels.contains_key(channel));

        (
            permissions_before - self.permissions.len(),
            channels_before - self.channels.len(),
        )
    }
}

/// Allocation information
#[derive(Debug, Clone)]
pub struct AllocationInfo {
    /// Allocation ID
    pub allocation_id: Uuid,
    /// Owning client tuple
    pub client: ClientTuple,
    /// Local relay transport address
    pub relay_addr: SocketAddr,
    /// Username that created the allocation
    pub username: String,
    /// Realm of the credentials
    pub realm: String,
    /// REQUESTED-TRANSPORT protocol number
    pub requested_transport: u8,
    /// Lifetime granted by the last Allocate or Refresh
    pub lifetime: Duration,
    /// Created timestamp
    pub created_at: Instant,
    /// Expires at
    pub expires_at: Instant,
    /// Permitted peer IPs
    pub permissions: Vec<IpAddr>,
    /// Channel bindings
    pub channels: Vec<ChannelBinding>,
    /// Bytes sent to peers
    pub bytes_to_peer: u64,
    /// Bytes delivered to the client
    pub bytes_to_client: u64,
}

impl AllocationInfo {
    /// Check if allocation is expired
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Limits and defaults the table enforces
#[derive(Debug, Clone)]
pub struct TableLimits {
    /// IP relay addresses are taken on
    pub relay_ip: IpAddr,
    pub relay_port_min: u16,
    pub relay_port_max: u16,
    pub default_lifetime: Duration,
    pub max_lifetime: Duration,
    pub permission_lifetime: Duration,
    pub channel_lifetime: Duration,
    pub max_allocations: usize,
    pub user_quota: usize,
    pub ip_quota: usize,
}

impl TableLimits {
    pub fn from_config(config: &TurnConfig) -> Result<Self, ConfigError> {
        let relay_ip = config.relay_ip.parse().map_err(|_| ConfigError::Invalid {
            key: "relay_ip",
            reason: format!("'{}' is not an IP address", config.relay_ip),
        })?;
        Ok(TableLimits {
            relay_ip,
            relay_port_min: config.relay_port_min,
            relay_port_max: config.relay_port_max,
            default_lifetime: config.default_lifetime(),
            max_lifetime: config.max_lifetime(),
            permission_lifetime: config.permission_lifetime(),
            channel_lifetime: config.channel_lifetime(),
            max_allocations: config.max_allocations,
            user_quota: config.user_quota,
            ip_quota: config.ip_quota,
        })
    }

    /// Lifetime granted for a request: between the default and the maximum
    pub fn grant(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_lifetime)
            .clamp(self.default_lifetime, self.max_lifetime)
    }
}

/// Parameters of an Allocate request that passed authentication
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    pub client: ClientTuple,
    pub username: String,
    pub realm: String,
    pub requested_transport: u8,
    /// LIFETIME from the request, if any
    pub lifetime: Option<Duration>,
}

/// Result of `allocate`
#[derive(Debug, Clone)]
pub struct Allocated {
    pub info: AllocationInfo,
    /// False when an identical retry returned the existing allocation
    pub created: bool,
    /// Expired allocation of the same tuple removed to make room
    pub replaced: Option<AllocationInfo>,
}

/// Result of `refresh`
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Refreshed(AllocationInfo),
    Deleted(AllocationInfo),
}

/// Where traffic arriving on a relay address goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRoute {
    pub client: ClientTuple,
    /// Bound channel for the peer, if any
    pub channel: Option<u16>,
    pub allocation_id: Uuid,
}

/// Where client traffic for a peer leaves from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRoute {
    pub relay_addr: SocketAddr,
    pub peer: SocketAddr,
    pub allocation_id: Uuid,
}

/// What an expiry sweep removed
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<AllocationInfo>,
    pub permissions_removed: usize,
    pub channels_removed: usize,
}

/// Table counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub allocations: usize,
    pub permissions: usize,
    pub channels: usize,
    pub bytes_to_peer: u64,
    pub bytes_to_client: u64,
    pub relay_ports_available: usize,
}

struct TableInner {
    allocations: HashMap<ClientTuple, Allocation>,
    by_relay: HashMap<SocketAddr, ClientTuple>,
    per_user: HashMap<String, usize>,
    per_ip: HashMap<IpAddr, usize>,
    ports: PortPool,
}

impl TableInner {
    fn remove(&mut self, client: &ClientTuple) -> Option<Allocation> {
        let allocation = self.allocations.remove(client)?;
        self.by_relay.remove(&allocation.relay_addr);
        self.ports.release(allocation.relay_addr.port());
        decrement(&mut self.per_user, &allocation.username);
        decrement(&mut self.per_ip, &client.addr.ip());
        Some(allocation)
    }

    fn live_mut(&mut self, client: &ClientTuple, now: Instant) -> Result<&mut Allocation, AllocError> {
        match self.allocations.get_mut(client) {
            Some(allocation) if allocation.is_live(now) => Ok(allocation),
            _ => Err(AllocError::AllocationMismatch),
        }
    }
}

fn decrement<K, Q>(counts: &mut HashMap<K, usize>, key: &Q)
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
{
    if let Some(count) = counts.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(key);
        }
    }
}

/// Allocation table
pub struct AllocationTable {
    limits: TableLimits,
    inner: RwLock<TableInner>,
}

impl AllocationTable {
    pub fn new(limits: TableLimits) -> Self {
        let ports = PortPool::new(limits.relay_port_min, limits.relay_port_max);
        AllocationTable {
            limits,
            inner: RwLock::new(TableInner {
                allocations: HashMap::new(),
                by_relay: HashMap::new(),
                per_user: HashMap::new(),
                per_ip: HashMap::new(),
                ports,
            }),
        }
    }

    pub fn limits(&self) -> &TableLimits {
        &self.limits
    }

    /// Create an allocation for `request.client`
    ///
    /// An identical retry (same username and transport) returns the
    /// existing allocation unchanged. Any other allocation already held by
    /// the tuple is a mismatch.
    pub fn allocate(&self, request: AllocateRequest) -> Result<Allocated, AllocError> {
        let now = Instant::now();
        let mut inner = self.inner.write();

        // An expired allocation the sweep has not reached yet is replaced;
        // it stops counting against the limits it held
        let stale_user = match inner.allocations.get(&request.client) {
            Some(existing) if existing.is_live(now) => {
                if existing.username == request.username
                    && existing.requested_transport == request.requested_transport
                {
                    return Ok(Allocated {
                        info: existing.snapshot(),
                        created: false,
                        replaced: None,
                    });
                }
                return Err(AllocError::AllocationMismatch);
            }
            Some(existing) => Some(existing.username.clone()),
            None => None,
        };
        let stale = usize::from(stale_user.is_some());
        let stale_same_user = usize::from(stale_user.as_deref() == Some(request.username.as_str()));

        if inner.allocations.len() - stale >= self.limits.max_allocations {
            return Err(AllocError::InsufficientCapacity);
        }
        let user_count = inner.per_user.get(&request.username).copied().unwrap_or(0);
        if user_count - stale_same_user >= self.limits.user_quota {
            return Err(AllocError::QuotaExceeded(request.username));
        }
        let client_ip = request.client.addr.ip();
        if inner.per_ip.get(&client_ip).copied().unwrap_or(0) - stale >= self.limits.ip_quota {
            return Err(AllocError::QuotaExceeded(client_ip.to_string()));
        }

        // Acquire before releasing the stale port so it is not handed back
        // while its socket may still be bound
        let port = inner.ports.acquire().ok_or(AllocError::InsufficientCapacity)?;
        let replaced = inner.remove(&request.client).map(|a| a.snapshot());
        let relay_addr = SocketAddr::new(self.limits.relay_ip, port);
        let lifetime = self.limits.grant(request.lifetime);

        let allocation = Allocation {
            id: Uuid::new_v4(),
            client: request.client,
            relay_addr,
            username: request.username,
            realm: request.realm,
            requested_transport: request.requested_transport,
            lifetime,
            created_at: now,
            expires_at: now + lifetime,
            permissions: HashMap::new(),
            channels: HashMap::new(),
            peer_channels: HashMap::new(),
            bytes_to_peer: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        };
        let info = allocation.snapshot();

        *inner.per_user.entry(allocation.username.clone()).or_insert(0) += 1;
        *inner.per_ip.entry(client_ip).or_insert(0) += 1;
        inner.by_relay.insert(relay_addr, request.client);
        inner.allocations.insert(request.client, allocation);

        Ok(Allocated {
            info,
            created: true,
            replaced,
        })
    }

    /// Live allocation held by `client`
    pub fn get(&self, client: &ClientTuple) -> Option<AllocationInfo> {
        let now = Instant::now();
        self.inner
            .read()
            .allocations
            .get(client)
            .filter(|allocation| allocation.is_live(now))
            .map(Allocation::snapshot)
    }

    /// Extend an allocation; a zero lifetime deletes it
    pub fn refresh(
        &self,
        client: &ClientTuple,
        username: &str,
        lifetime: Option<Duration>,
    ) -> Result<RefreshOutcome, AllocError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let allocation = inner.live_mut(client, now)?;
        allocation.ensure_owner(username)?;

        if lifetime == Some(Duration::ZERO) {
            let removed = inner
                .remove(client)
                .ok_or(AllocError::AllocationMismatch)?;
            return Ok(RefreshOutcome::Deleted(removed.snapshot()));
        }

        let granted = self.limits.grant(lifetime);
        allocation.lifetime = granted;
        allocation.expires_at = now + granted;
        Ok(RefreshOutcome::Refreshed(allocation.snapshot()))
    }

    /// Install or refresh permissions for every IP in `peers`
    pub fn create_permission(
        &self,
        client: &ClientTuple,
        username: &str,
        peers: &[IpAddr],
    ) -> Result<AllocationInfo, AllocError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let allocation = inner.live_mut(client, now)?;
        allocation.ensure_owner(username)?;

        let expires_at = now + self.limits.permission_lifetime;
        for peer in peers {
            allocation.permissions.insert(*peer, expires_at);
        }
        Ok(allocation.snapshot())
    }

    /// Bind `channel` to `peer`, refreshing the peer's permission
    ///
    /// Rebinding the same pair refreshes the binding.
    pub fn channel_bind(
        &self,
        client: &ClientTuple,
        username: &str,
        channel: u16,
        peer: SocketAddr,
    ) -> Result<AllocationInfo, AllocError> {
        if !is_valid_channel(channel) {
            return Err(AllocError::InvalidChannel(channel));
        }
        let now = Instant::now();
        let mut inner = self.inner.write();
        let allocation = inner.live_mut(client, now)?;
        allocation.ensure_owner(username)?;
        allocation.prune(now);

        if let Some(existing) = allocation.channels.get(&channel) {
            if existing.peer != peer {
                return Err(AllocError::ChannelInUse(channel));
            }
        }
        if let Some(bound) = allocation.peer_channels.get(&peer) {
            if *bound != channel {
                return Err(AllocError::PeerAlreadyBound(peer));
            }
        }

        allocation.channels.insert(
            channel,
            ChannelBinding {
                channel,
                peer,
                expires_at: now + self.limits.channel_lifetime,
            },
        );
        allocation.peer_channels.insert(peer, channel);
        allocation
            .permissions
            .insert(peer.ip(), now + self.limits.permission_lifetime);
        Ok(allocation.snapshot())
    }

    /// Route for data arriving on `relay_addr` from `peer`
    ///
    /// `NotFound` when no live allocation owns the relay address or the
    /// peer has no live permission.
    pub fn lookup_by_relay_traffic(
        &self,
        relay_addr: &SocketAddr,
        peer: &SocketAddr,
    ) -> Result<RelayRoute, AllocError> {
        let now = Instant::now();
        let inner = self.inner.read();
        let client = inner.by_relay.get(relay_addr).ok_or(AllocError::NotFound)?;
        let allocation = inner
            .allocations
            .get(client)
            .filter(|allocation| allocation.is_live(now))
            .ok_or(AllocError::NotFound)?;
        if !allocation.is_permitted(peer.ip(), now) {
            return Err(AllocError::NotFound);
        }
        Ok(RelayRoute {
            client: allocation.client,
            channel: allocation.live_channel_for(peer, now),
            allocation_id: allocation.id,
        })
    }

    /// Route for a Send indication from `client` to `peer`
    pub fn route_to_peer(&self, client: &ClientTuple, peer: &SocketAddr) -> Result<PeerRoute, AllocError> {
        let now = Instant::now();
        let inner = self.inner.read();
        let allocation = inner
            .allocations
            .get(client)
            .filter(|allocation| allocation.is_live(now))
            .ok_or(AllocError::NotFound)?;
        if !allocation.is_permitted(peer.ip(), now) {
            return Err(AllocError::NotFound);
        }
        Ok(PeerRoute {
            relay_addr: allocation.relay_addr,
            peer: *peer,
            allocation_id: allocation.id,
        })
    }

    /// Route for ChannelData from `client` on `channel`
    pub fn route_channel(&self, client: &ClientTuple, channel: u16) -> Result<PeerRoute, AllocError> {
        let now = Instant::now();
        let inner = self.inner.read();
        let allocation = inner
            .allocations
            .get(client)
            .filter(|allocation| allocation.is_live(now))
            .ok_or(AllocError::NotFound)?;
        let binding = allocation
            .channels
            .get(&channel)
            .filter(|binding| binding.expires_at > now)
            .ok_or(AllocError::NotFound)?;
        if !allocation.is_permitted(binding.peer.ip(), now) {
            return Err(AllocError::NotFound);
        }
        Ok(PeerRoute {
            relay_addr: allocation.relay_addr,
            peer: binding.peer,
            allocation_id: allocation.id,
        })
    }

    /// Count relayed bytes against `client`'s allocation
    pub fn record_relayed(&self, client: &ClientTuple, direction: RelayDirection, bytes: usize) {
        let inner = self.inner.read();
        if let Some(allocation) = inner.allocations.get(client) {
            let counter = match direction {
                RelayDirection::ToPeer => &allocation.bytes_to_peer,
                RelayDirection::ToClient => &allocation.bytes_to_client,
            };
            counter.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    /// Remove `client`'s allocation whatever its state
    pub fn delete(&self, client: &ClientTuple) -> Option<AllocationInfo> {
        self.inner.write().remove(client).map(|a| a.snapshot())
    }

    /// Remove everything past its deadline
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let mut report = SweepReport::default();

        let expired: Vec<ClientTuple> = inner
            .allocations
            .iter()
            .filter(|(_, allocation)| !allocation.is_live(now))
            .map(|(client, _)| *client)
            .collect();
        for client in expired {
            if let Some(allocation) = inner.remove(&client) {
                report.expired.push(allocation.snapshot());
            }
        }

        for allocation in inner.allocations.values_mut() {
            let (permissions, channels) = allocation.prune(now);
            report.permissions_removed += permissions;
            report.channels_removed += channels;
        }
        report
    }

    /// Remove every allocation, for shutdown
    pub fn drain_all(&self) -> Vec<AllocationInfo> {
        let mut inner = self.inner.write();
        let clients: Vec<ClientTuple> = inner.allocations.keys().copied().collect();
        clients
            .iter()
            .filter_map(|client| inner.remove(client))
            .map(|allocation| allocation.snapshot())
            .collect()
    }

    pub fn stats(&self) -> TableStats {
        let inner = self.inner.read();
        let mut stats = TableStats {
            allocations: inner.allocations.len(),
            relay_ports_available: inner.ports.available(),
            ..TableStats::default()
        };
        for allocation in inner.allocations.values() {
            stats.permissions += allocation.permissions.len();
            stats.channels += allocation.channels.len();
            stats.bytes_to_peer += allocation.bytes_to_peer.load(Ordering::Relaxed);
            stats.bytes_to_client += allocation.bytes_to_client.load(Ordering::Relaxed);
        }
        stats
    }

    /// Get allocation count
    pub fn allocation_count(&self) -> usize {
        self.inner.read().allocations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PROTOCOL_UDP;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn create_test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn peer_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), port)
    }

    fn client(port: u16) -> ClientTuple {
        ClientTuple::new(create_test_addr(port), TransportProtocol::Udp)
    }

    fn limits() -> TableLimits {
        TableLimits {
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            relay_port_min: 49152,
            relay_port_max: 49651,
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            permission_lifetime: Duration::from_secs(300),
            channel_lifetime: Duration::from_secs(600),
            max_allocations: 1000,
            user_quota: 1000,
            ip_quota: 1000,
        }
    }

    fn request(client: ClientTuple, username: &str) -> AllocateRequest {
        AllocateRequest {
            client,
            username: username.to_string(),
            realm: "pjsip.org".to_string(),
            requested_transport: PROTOCOL_UDP,
            lifetime: None,
        }
    }

    #[test]
    fn test_lifetime_grant_is_clamped() {
        let limits = limits();
        assert_eq!(limits.grant(None), Duration::from_secs(600));
        assert_eq!(limits.grant(Some(Duration::from_secs(60))), Duration::from_secs(600));
        assert_eq!(limits.grant(Some(Duration::from_secs(1200))), Duration::from_secs(1200));
        assert_eq!(limits.grant(Some(Duration::from_secs(86400))), Duration::from_secs(3600));
    }

    #[test]
    fn test_create_allocation() {
        let table = AllocationTable::new(limits());
        let allocated = table.allocate(request(client(50000), "alice")).unwrap();
        assert!(allocated.created);
        assert_eq!(allocated.info.client, client(50000));
        assert_eq!(allocated.info.lifetime, Duration::from_secs(600));
        assert!(!allocated.info.is_expired());
        assert_eq!(table.allocation_count(), 1);
        assert_eq!(table.get(&client(50000)).unwrap().allocation_id, allocated.info.allocation_id);
    }

    #[test]
    fn test_identical_retry_is_idempotent() {
        let table = AllocationTable::new(limits());
        let first = table.allocate(request(client(50000), "alice")).unwrap();
        let second = table.allocate(request(client(50000), "alice")).unwrap();
        assert!(!second.created);
        assert_eq!(first.info.allocation_id, second.info.allocation_id);
        assert_eq!(first.info.relay_addr, second.info.relay_addr);
        assert_eq!(table.allocation_count(), 1);
    }

    #[test]
    fn test_other_user_on_same_tuple_is_mismatch() {
        let table = AllocationTable::new(limits());
        table.allocate(request(client(50000), "alice")).unwrap();
        assert_eq!(
            table.allocate(request(client(50000), "bob")).unwrap_err(),
            AllocError::AllocationMismatch
        );
    }

    #[test]
    fn test_same_address_other_protocol_is_distinct() {
        let table = AllocationTable::new(limits());
        let udp = table.allocate(request(client(50000), "alice")).unwrap();
        let tcp_client = ClientTuple::new(create_test_addr(50000), TransportProtocol::Tcp);
        let tcp = table.allocate(request(tcp_client, "alice")).unwrap();
        assert_ne!(udp.info.relay_addr, tcp.info.relay_addr);
    }

    #[test]
    fn test_distinct_tuples_get_distinct_relay_addresses() {
        let table = AllocationTable::new(limits());
        let relays: HashSet<SocketAddr> = (0..200)
            .map(|i| table.allocate(request(client(40000 + i), "alice")).unwrap().info.relay_addr)
            .collect();
        assert_eq!(relays.len(), 200);
    }

    #[test]
    fn test_quotas() {
        let mut limits = limits();
        limits.user_quota = 2;
        limits.ip_quota = 3;
        let table = AllocationTable::new(limits);

        table.allocate(request(client(1), "alice")).unwrap();
        table.allocate(request(client(2), "alice")).unwrap();
        assert_eq!(
            table.allocate(request(client(3), "alice")).unwrap_err(),
            AllocError::QuotaExceeded("alice".to_string())
        );

        table.allocate(request(client(3), "bob")).unwrap();
        assert!(matches!(
            table.allocate(request(client(4), "carol")).unwrap_err(),
            AllocError::QuotaExceeded(ip) if ip == "127.0.0.1"
        ));

        table.delete(&client(1));
        table.allocate(request(client(5), "alice")).unwrap();
    }

    #[test]
    fn test_port_exhaustion_is_insufficient_capacity() {
        let mut limits = limits();
        limits.relay_port_min = 50000;
        limits.relay_port_max = 50001;
        let table = AllocationTable::new(limits);
        table.allocate(request(client(1), "alice")).unwrap();
        table.allocate(request(client(2), "alice")).unwrap();
        assert_eq!(
            table.allocate(request(client(3), "alice")).unwrap_err(),
            AllocError::InsufficientCapacity
        );
    }

    #[test]
    fn test_global_ceiling_is_insufficient_capacity() {
        let mut limits = limits();
        limits.max_allocations = 1;
        let table = AllocationTable::new(limits);
        table.allocate(request(client(1), "alice")).unwrap();
        assert_eq!(
            table.allocate(request(client(2), "bob")).unwrap_err(),
            AllocError::InsufficientCapacity
        );
    }

    #[test]
    fn test_refresh_zero_deletes_and_releases() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        let first = table.allocate(request(c, "alice")).unwrap();

        match table.refresh(&c, "alice", Some(Duration::ZERO)).unwrap() {
            RefreshOutcome::Deleted(info) => assert_eq!(info.allocation_id, first.info.allocation_id),
            other => panic!("expected deletion, got {:?}", other),
        }
        assert!(table.get(&c).is_none());
        assert_eq!(
            table.refresh(&c, "alice", None).unwrap_err(),
            AllocError::AllocationMismatch
        );

        let second = table.allocate(request(c, "alice")).unwrap();
        assert!(second.created);
        assert_ne!(first.info.allocation_id, second.info.allocation_id);
    }

    #[test]
    fn test_refresh_by_other_user_is_rejected() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        table.allocate(request(c, "alice")).unwrap();
        assert_eq!(
            table.refresh(&c, "mallory", Some(Duration::ZERO)).unwrap_err(),
            AllocError::WrongOwner
        );
        assert!(table.get(&c).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_deadline() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        table.allocate(request(c, "alice")).unwrap();

        tokio::time::advance(Duration::from_secs(500)).await;
        match table.refresh(&c, "alice", Some(Duration::from_secs(900))).unwrap() {
            RefreshOutcome::Refreshed(info) => assert_eq!(info.remaining(), Duration::from_secs(900)),
            other => panic!("expected refresh, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(899)).await;
        assert_eq!(table.sweep().expired.len(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        let report = table.sweep();
        assert_eq!(report.expired.len(), 1);
        assert_eq!(table.stats().relay_ports_available, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocate_replaces_unswept_expired_allocation() {
        let mut limits = limits();
        limits.user_quota = 1;
        limits.max_allocations = 1;
        let table = AllocationTable::new(limits);
        let c = client(50000);
        let first = table.allocate(request(c, "alice")).unwrap();
        assert!(first.replaced.is_none());

        tokio::time::advance(Duration::from_secs(601)).await;
        let second = table.allocate(request(c, "alice")).unwrap();
        assert!(second.created);
        let replaced = second.replaced.expect("expired allocation reported");
        assert_eq!(replaced.allocation_id, first.info.allocation_id);
        assert_ne!(second.info.relay_addr, first.info.relay_addr);

        let stats = table.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.relay_ports_available, 499);
        assert!(table.sweep().expired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_expires_before_allocation() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        let relay = table.allocate(request(c, "alice")).unwrap().info.relay_addr;
        let peer = peer_addr(7000);
        table.create_permission(&c, "alice", &[peer.ip()]).unwrap();

        let route = table.lookup_by_relay_traffic(&relay, &peer).unwrap();
        assert_eq!(route.client, c);
        assert_eq!(route.channel, None);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(
            table.lookup_by_relay_traffic(&relay, &peer).unwrap_err(),
            AllocError::NotFound
        );
        assert!(table.get(&c).is_some());

        let report = table.sweep();
        assert!(report.expired.is_empty());
        assert_eq!(report.permissions_removed, 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(table.get(&c).is_none());
        assert_eq!(table.sweep().expired.len(), 1);
    }

    #[test]
    fn test_unpermitted_peer_is_not_routed() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        let relay = table.allocate(request(c, "alice")).unwrap().info.relay_addr;
        table.create_permission(&c, "alice", &[peer_addr(1).ip()]).unwrap();

        let stranger = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 1);
        assert!(table.lookup_by_relay_traffic(&relay, &stranger).is_err());
        assert!(table.route_to_peer(&c, &stranger).is_err());
        assert!(table.route_to_peer(&c, &peer_addr(9999)).is_ok());
    }

    #[test]
    fn test_channel_bind_conflicts() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        table.allocate(request(c, "alice")).unwrap();

        table.channel_bind(&c, "alice", 0x4000, peer_addr(7000)).unwrap();
        // Same pair refreshes
        table.channel_bind(&c, "alice", 0x4000, peer_addr(7000)).unwrap();
        assert_eq!(
            table.channel_bind(&c, "alice", 0x4000, peer_addr(7001)).unwrap_err(),
            AllocError::ChannelInUse(0x4000)
        );
        assert_eq!(
            table.channel_bind(&c, "alice", 0x4001, peer_addr(7000)).unwrap_err(),
            AllocError::PeerAlreadyBound(peer_addr(7000))
        );
        assert_eq!(
            table.channel_bind(&c, "alice", 0x3FFF, peer_addr(7002)).unwrap_err(),
            AllocError::InvalidChannel(0x3FFF)
        );
        assert_eq!(table.get(&c).unwrap().channels.len(), 1);
    }

    #[test]
    fn test_channel_bind_installs_permission_and_routes() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        let relay = table.allocate(request(c, "alice")).unwrap().info.relay_addr;
        let peer = peer_addr(7000);

        table.channel_bind(&c, "alice", 0x4abc, peer).unwrap();
        let inbound = table.lookup_by_relay_traffic(&relay, &peer).unwrap();
        assert_eq!(inbound.channel, Some(0x4abc));

        let outbound = table.route_channel(&c, 0x4abc).unwrap();
        assert_eq!(outbound.peer, peer);
        assert_eq!(outbound.relay_addr, relay);
        assert!(table.route_channel(&c, 0x4abd).is_err());
    }

    #[test]
    fn test_operations_need_live_allocation_and_owner() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        assert_eq!(
            table.create_permission(&c, "alice", &[peer_addr(1).ip()]).unwrap_err(),
            AllocError::AllocationMismatch
        );
        table.allocate(request(c, "alice")).unwrap();
        assert_eq!(
            table.channel_bind(&c, "bob", 0x4000, peer_addr(1)).unwrap_err(),
            AllocError::WrongOwner
        );
    }

    #[test]
    fn test_record_relayed_and_stats() {
        let table = AllocationTable::new(limits());
        let c = client(50000);
        table.allocate(request(c, "alice")).unwrap();
        table.create_permission(&c, "alice", &[peer_addr(1).ip()]).unwrap();
        table.record_relayed(&c, RelayDirection::ToPeer, 100);
        table.record_relayed(&c, RelayDirection::ToClient, 40);

        let stats = table.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.permissions, 1);
        assert_eq!(stats.bytes_to_peer, 100);
        assert_eq!(stats.bytes_to_client, 40);
        assert_eq!(stats.relay_ports_available, 499);
    }

    #[test]
    fn test_drain_all_releases_everything() {
        let table = AllocationTable::new(limits());
        for port in 0..10 {
            table.allocate(request(client(port), "alice")).unwrap();
        }
        assert_eq!(table.drain_all().len(), 10);
        assert_eq!(table.allocation_count(), 0);
        assert_eq!(table.stats().relay_ports_available, 500);
    }

    #[test]
    fn test_concurrent_allocations() {
        let table = Arc::new(AllocationTable::new(limits()));
        let handles: Vec<_> = (0..100u16)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    table
                        .allocate(request(client(20000 + i), &format!("user{}", i % 7)))
                        .unwrap()
                        .info
                        .relay_addr
                })
            })
            .collect();
        let relays: HashSet<SocketAddr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(relays.len(), 100);
        assert_eq!(table.allocation_count(), 100);
    }
}
