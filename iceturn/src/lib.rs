//! TURN relay server
//!
//! Allocation and session engine for TURN (RFC 5766) over UDP and TCP:
//! the STUN codec, long-term credential authentication, the allocation
//! table with its permissions and channel bindings, and the relay data
//! path between clients and peers.
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


pub mod allocation;
pub mod auth;
pub mod codec;
pub mod error;
pub mod events;
pub mod listener;
pub mod port_pool;
pub mod relay;
pub mod relay_server;
pub mod stun_turn_handler;

pub use allocation::{AllocationInfo, AllocationTable, ClientTuple, TransportProtocol};
pub use auth::{long_term_key, CredentialStore, StaticCredentials};
pub use error::{AllocError, AuthError, CodecError, RelayError, RelayResult};
pub use events::{AllocationEvent, DeleteReason};
pub use listener::{listen, listen_with, IceAddr, Listener};
pub use relay_server::{RelayStats, TurnServer};
pub use stun_turn_handler::StunTurnHandler;
