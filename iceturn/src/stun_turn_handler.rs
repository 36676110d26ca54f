//! STUN/TURN protocol handler
//!
//! Control plane: decodes requests, runs the long-term credential check,
//! applies Allocate, Refresh, CreatePermission and ChannelBind to the
//! allocation table and encodes the response. Send indications and
//! ChannelData are handed to the relay plane.
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


use crate::allocation::{AllocateRequest, AllocationInfo, AllocationTable, ClientTuple, RefreshOutcome};
use crate::auth::{AuthOk, Authenticator};
use crate::codec::{
    decode, peek_header, Attribute, ChannelData, Class, DecodedMessage, ErrorCode, Message, Method,
    PROTOCOL_UDP,
};
use crate::error::{AllocError, RelayError, RelayResult};
use crate::events::{AllocationEvent, DeleteReason, EventBus};
use crate::relay::{ClientSink, RelayPlane};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Relay ports tried per Allocate before answering 508
pub const BIND_ATTEMPTS: usize = 3;

/// STUN/TURN handler
pub struct StunTurnHandler {
    table: Arc<AllocationTable>,
    relay: Arc<RelayPlane>,
    auth: Authenticator,
    events: EventBus,
    /// IP put in XOR-RELAYED-ADDRESS
    advertised_ip: IpAddr,
    /// SOFTWARE attribute value
    software: Option<String>,
}

impl StunTurnHandler {
    /// Create a new STUN/TURN handler
    pub fn new(
        table: Arc<AllocationTable>,
        relay: Arc<RelayPlane>,
        auth: Authenticator,
        events: EventBus,
        advertised_ip: IpAddr,
        software: Option<String>,
    ) -> Self {
        StunTurnHandler {
            table,
            relay,
            auth,
            events,
            advertised_ip,
            software: software.filter(|s| !s.is_empty()),
        }
    }

    pub fn table(&self) -> &Arc<AllocationTable> {
        &self.table
    }

    pub fn relay(&self) -> &Arc<RelayPlane> {
        &self.relay
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle one STUN message from `client`, returning the response to send
    pub async fn handle_message(&self, raw: &[u8], client: ClientTuple, sink: &ClientSink) -> Option<Bytes> {
        let request = match decode(raw) {
            Ok((request, _)) => request,
            Err(e) => {
                debug!(client = %client, error = %e, "Undecodable STUN message");
                return match peek_header(raw) {
                    Some((method, Class::Request, transaction_id)) => {
                        let request = Message::new(method, Class::Request, transaction_id);
                        Some(self.finalize(Message::error_for(&request, ErrorCode::BAD_REQUEST), None))
                    }
                    _ => None,
                };
            }
        };

        match request.message.class {
            Class::Request => Some(self.handle_request(&request, client, sink).await),
            Class::Indication => {
                self.handle_indication(&request.message, &client);
                None
            }
            Class::SuccessResponse | Class::ErrorResponse => {
                debug!(client = %client, "Ignoring STUN response sent to server");
                None
            }
        }
    }

    /// ChannelData from `client`
    pub fn handle_channel_data(&self, frame: &ChannelData, client: &ClientTuple) {
        self.relay.forward_channel_data(client, frame);
    }

    /// The client's TCP connection went away
    pub fn client_disconnected(&self, client: &ClientTuple) {
        self.auth.nonces().forget(client);
        if let Some(info) = self.table.delete(client) {
            self.relay.close(&info.relay_addr);
            info!(
                client = %client,
                allocation_id = %info.allocation_id,
                "Allocation deleted, connection closed"
            );
            self.events.publish(AllocationEvent::Deleted {
                allocation_id: info.allocation_id,
                client: info.client,
                reason: DeleteReason::ConnectionClosed,
            });
        }
    }

    /// Remove expired allocations, permissions, bindings and nonces
    pub fn sweep_expired(&self) -> usize {
        let report = self.table.sweep();
        for info in &report.expired {
            self.retire_expired(info);
        }
        let nonces = self.auth.nonces().sweep();
        if report.permissions_removed > 0 || report.channels_removed > 0 || nonces > 0 {
            debug!(
                permissions = report.permissions_removed,
                channels = report.channels_removed,
                nonces,
                "Expired entries swept"
            );
        }
        report.expired.len()
    }

    fn retire_expired(&self, info: &AllocationInfo) {
        self.relay.close(&info.relay_addr);
        info!(
            client = %info.client,
            allocation_id = %info.allocation_id,
            relay = %info.relay_addr,
            "Allocation expired"
        );
        self.events.publish(AllocationEvent::Deleted {
            allocation_id: info.allocation_id,
            client: info.client,
            reason: DeleteReason::Expired,
        });
    }

    /// Delete every allocation and close every relay socket
    pub async fn shutdown(&self) -> usize {
        let drained = self.table.drain_all();
        for info in &drained {
            self.events.publish(AllocationEvent::Deleted {
                allocation_id: info.allocation_id,
                client: info.client,
                reason: DeleteReason::Shutdown,
            });
        }
        self.relay.close_all().await;
        drained.len()
    }

    async fn handle_request(&self, request: &DecodedMessage, client: ClientTuple, sink: &ClientSink) -> Bytes {
        let message = &request.message;
        match message.method {
            Method::Binding => {
                let response = Message::success_for(message).with(Attribute::XorMappedAddress(client.addr));
                return self.finalize(response, None);
            }
            Method::Unknown(bits) => {
                debug!(client = %client, method = bits, "Unknown STUN method");
                return self.finalize(Message::error_for(message, ErrorCode::BAD_REQUEST), None);
            }
            Method::Send | Method::Data => {
                return self.finalize(Message::error_for(message, ErrorCode::BAD_REQUEST), None);
            }
            _ => {}
        }

        let unknown = request.unknown_comprehension_required();
        if !unknown.is_empty() {
            let response = Message::error_for(message, ErrorCode::UNKNOWN_ATTRIBUTE)
                .with(Attribute::UnknownAttributes(unknown));
            return self.finalize(response, None);
        }

        let auth = match self.auth.authenticate(request, &client).await {
            Ok(auth) => auth,
            Err(e) => {
                let code = e.error_code();
                debug!(client = %client, error = %e, code = code.code, "Authentication failed");
                self.events.publish(AllocationEvent::AuthFailed {
                    client,
                    code: code.code,
                });
                let response = Message::error_for(message, code)
                    .with(Attribute::Realm(self.auth.realm().to_string()))
                    .with(Attribute::Nonce(self.auth.issue_nonce(&client)));
                return self.finalize(response, None);
            }
        };

        let result = match message.method {
            Method::Allocate => self.handle_allocate(message, &client, &auth, sink).await,
            Method::Refresh => self.handle_refresh(message, &client, &auth),
            Method::CreatePermission => self.handle_create_permission(message, &client, &auth),
            Method::ChannelBind => self.handle_channel_bind(message, &client, &auth),
            _ => Err(RelayError::InvariantViolation(format!(
                "{:?} reached authenticated dispatch",
                message.method
            ))),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let code = e.error_code();
                if code.code >= 500 {
                    warn!(client = %client, error = %e, "Request failed");
                } else {
                    debug!(client = %client, error = %e, code = code.code, "Request rejected");
                }
                Message::error_for(message, code)
            }
        };
        self.finalize(response, Some(&auth.key))
    }

    async fn handle_allocate(
        &self,
        message: &Message,
        client: &ClientTuple,
        auth: &AuthOk,
        sink: &ClientSink,
    ) -> RelayResult<Message> {
        let transport = message
            .requested_transport()
            .ok_or_else(|| RelayError::InvalidRequest("missing REQUESTED-TRANSPORT".to_string()))?;
        if transport != PROTOCOL_UDP {
            return Err(RelayError::UnsupportedTransport(transport));
        }

        let request = AllocateRequest {
            client: *client,
            username: auth.username.clone(),
            realm: self.auth.realm().to_string(),
            requested_transport: transport,
            lifetime: message.lifetime().map(|secs| Duration::from_secs(u64::from(secs))),
        };

        for attempt in 1..=BIND_ATTEMPTS {
            let allocated = self.table.allocate(request.clone())?;
            if let Some(replaced) = &allocated.replaced {
                self.retire_expired(replaced);
            }
            let info = allocated.info;
            if allocated.created {
                if let Err(e) = self.relay.open(info.relay_addr, *client, sink.clone()).await {
                    warn!(
                        client = %client,
                        relay = %info.relay_addr,
                        attempt,
                        error = %e,
                        "Failed to bind relay socket"
                    );
                    self.table.delete(client);
                    continue;
                }
                info!(
                    client = %client,
                    username = %info.username,
                    allocation_id = %info.allocation_id,
                    relay = %info.relay_addr,
                    lifetime_secs = info.lifetime.as_secs(),
                    "Allocation created"
                );
                self.events.publish(AllocationEvent::Created {
                    allocation_id: info.allocation_id,
                    client: info.client,
                    relay_addr: info.relay_addr,
                    username: info.username.clone(),
                    lifetime: info.lifetime,
                });
            }

            let lifetime = if allocated.created {
                info.lifetime
            } else {
                info.remaining()
            };
            let relayed = SocketAddr::new(self.advertised_ip, info.relay_addr.port());
            return Ok(Message::success_for(message)
                .with(Attribute::XorRelayedAddress(relayed))
                .with(Attribute::Lifetime(lifetime.as_secs() as u32))
                .with(Attribute::XorMappedAddress(client.addr)));
        }

        Err(AllocError::InsufficientCapacity.into())
    }

    fn handle_refresh(&self, message: &Message, client: &ClientTuple, auth: &AuthOk) -> RelayResult<Message> {
        let lifetime = message.lifetime().map(|secs| Duration::from_secs(u64::from(secs)));
        match self.table.refresh(client, &auth.username, lifetime)? {
            RefreshOutcome::Deleted(info) => {
                self.relay.close(&info.relay_addr);
                info!(client = %client, allocation_id = %info.allocation_id, "Allocation deleted by client");
                self.events.publish(AllocationEvent::Deleted {
                    allocation_id: info.allocation_id,
                    client: info.client,
                    reason: DeleteReason::Requested,
                });
                Ok(Message::success_for(message).with(Attribute::Lifetime(0)))
            }
            RefreshOutcome::Refreshed(info) => {
                debug!(client = %client, allocation_id = %info.allocation_id, "Allocation refreshed");
                self.events.publish(AllocationEvent::Refreshed {
                    allocation_id: info.allocation_id,
                    client: info.client,
                    lifetime: info.lifetime,
                });
                Ok(Message::success_for(message).with(Attribute::Lifetime(info.lifetime.as_secs() as u32)))
            }
        }
    }

    fn handle_create_permission(&self, message: &Message, client: &ClientTuple, auth: &AuthOk) -> RelayResult<Message> {
        let peers: Vec<IpAddr> = message.xor_peer_addresses().iter().map(SocketAddr::ip).collect();
        if peers.is_empty() {
            return Err(RelayError::InvalidRequest("missing XOR-PEER-ADDRESS".to_string()));
        }
        let info = self.table.create_permission(client, &auth.username, &peers)?;
        debug!(client = %client, allocation_id = %info.allocation_id, peers = ?peers, "Permissions installed");
        Ok(Message::success_for(message))
    }

    fn handle_channel_bind(&self, message: &Message, client: &ClientTuple, auth: &AuthOk) -> RelayResult<Message> {
        let channel = message
            .channel_number()
            .ok_or_else(|| RelayError::InvalidRequest("missing CHANNEL-NUMBER".to_string()))?;
        let peers = message.xor_peer_addresses();
        let [peer] = peers.as_slice() else {
            return Err(RelayError::InvalidRequest(
                "ChannelBind needs exactly one XOR-PEER-ADDRESS".to_string(),
            ));
        };
        let info = self.table.channel_bind(client, &auth.username, channel, *peer)?;
        debug!(
            client = %client,
            allocation_id = %info.allocation_id,
            channel,
            peer = %peer,
            "Channel bound"
        );
        Ok(Message::success_for(message))
    }

    fn handle_indication(&self, message: &Message, client: &ClientTuple) {
        if message.method != Method::Send {
            debug!(client = %client, method = ?message.method, "Ignoring indication");
            return;
        }
        let (Some(peer), Some(data)) = (message.xor_peer_addresses().first().copied(), message.data()) else {
            debug!(client = %client, "Send indication without peer or data");
            return;
        };
        self.relay.forward_from_client(client, peer, data);
    }

    fn finalize(&self, mut response: Message, key: Option<&[u8]>) -> Bytes {
        if let Some(software) = &self.software {
            response.push(Attribute::Software(software.clone()));
        }
        response.encode_with(key, true)
    }
}
