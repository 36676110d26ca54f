//! Allocation lifecycle events
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


use crate::allocation::ClientTuple;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events buffered per subscriber before the slowest one starts lagging
pub const EVENT_CAPACITY: usize = 1024;

/// Why an allocation went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Refresh with lifetime 0
    Requested,
    /// Lifetime ran out
    Expired,
    /// TCP control connection closed
    ConnectionClosed,
    /// Server stopped
    Shutdown,
}

/// Something that happened to an allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationEvent {
    Created {
        allocation_id: Uuid,
        client: ClientTuple,
        relay_addr: SocketAddr,
        username: String,
        lifetime: Duration,
    },
    Refreshed {
        allocation_id: Uuid,
        client: ClientTuple,
        lifetime: Duration,
    },
    Deleted {
        allocation_id: Uuid,
        client: ClientTuple,
        reason: DeleteReason,
    },
    /// A request failed the credential check
    AuthFailed {
        client: ClientTuple,
        /// 401 or 438
        code: u16,
    },
}

/// Fan-out of allocation events
///
/// Publishing never blocks. With no subscribers events are discarded.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AllocationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn publish(&self, event: AllocationEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AllocationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::TransportProtocol;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let client = ClientTuple::new("127.0.0.1:5000".parse().unwrap(), TransportProtocol::Udp);
        bus.publish(AllocationEvent::AuthFailed { client, code: 401 });

        assert_eq!(
            first.recv().await.unwrap(),
            AllocationEvent::AuthFailed { client, code: 401 }
        );
        assert_eq!(
            second.recv().await.unwrap(),
            AllocationEvent::AuthFailed { client, code: 401 }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        let client = ClientTuple::new("127.0.0.1:5000".parse().unwrap(), TransportProtocol::Tcp);
        bus.publish(AllocationEvent::AuthFailed { client, code: 438 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
