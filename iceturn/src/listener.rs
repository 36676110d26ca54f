//! `listen` entry point and the `ICE://` listener address
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


use crate::error::RelayResult;
use crate::events::AllocationEvent;
use crate::relay_server::{RelayStats, TurnServer};
use iceturn_config::{ListenProtocol, TurnConfig};
use std::fmt;
use tokio::sync::broadcast;

/// Network name reported by listener addresses
pub const ICE_NETWORK: &str = "ICE";

/// Address of a running listener, rendered as `ICE://host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceAddr {
    host: String,
    port: u16,
}

impl IceAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        IceAddr {
            host: host.into(),
            port,
        }
    }

    pub fn network(&self) -> &'static str {
        ICE_NETWORK
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for IceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", ICE_NETWORK, self.host, self.port)
    }
}

/// A started TURN server
pub struct Listener {
    server: TurnServer,
    addr: IceAddr,
}

impl Listener {
    pub fn addr(&self) -> &IceAddr {
        &self.addr
    }

    /// Allocation lifecycle events
    pub fn events(&self) -> broadcast::Receiver<AllocationEvent> {
        self.server.subscribe()
    }

    pub fn stats(&self) -> RelayStats {
        self.server.stats()
    }

    pub fn server(&self) -> &TurnServer {
        &self.server
    }

    /// Stop the server and release every allocation
    pub async fn close(mut self) {
        self.server.stop().await;
    }
}

/// Start a server on `host:port`
///
/// `net` is `udp` (UDP only) or `tcp` (UDP and TCP on the same port).
/// Everything else comes from [`TurnConfig::from_env`].
pub async fn listen(net: &str, host: &str, port: u16) -> RelayResult<Listener> {
    let protocol: ListenProtocol = net.parse()?;
    let mut config = TurnConfig::from_env()?;
    config.listen_protocol = protocol;
    config.listen_host = host.to_string();
    config.listen_port = port;
    listen_with(config).await
}

/// Start a server from a complete configuration
pub async fn listen_with(config: TurnConfig) -> RelayResult<Listener> {
    let host = config.listen_host.clone();
    let server = TurnServer::start(config).await?;
    let addr = IceAddr::new(host, server.local_udp_addr().port());
    Ok(Listener { server, addr })
}
