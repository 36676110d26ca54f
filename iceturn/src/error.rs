//! Error types for the TURN relay
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


use crate::codec::ErrorCode;
use iceturn_config::ConfigError;
use thiserror::Error;

/// Wire format errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bad magic cookie, bad leading bits or a length that cannot be right
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Attribute body is invalid or runs past the end of the message
    #[error("Malformed attribute 0x{attr_type:04x}: {reason}")]
    MalformedAttribute { attr_type: u16, reason: String },

    /// Not enough bytes yet
    #[error("Truncated message: need {needed} bytes, have {available}")]
    TruncatedMessage { needed: usize, available: usize },

    /// Stream I/O failure while framing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Allocation table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The client tuple already holds an allocation with other parameters,
    /// or the request needs an allocation the tuple does not have
    #[error("Allocation mismatch")]
    AllocationMismatch,

    /// No allocation for the client tuple
    #[error("Allocation not found")]
    NotFound,

    /// Relay port pool exhausted or global ceiling reached
    #[error("Insufficient capacity")]
    InsufficientCapacity,

    /// Per-user or per-IP ceiling reached
    #[error("Allocation quota exceeded for {0}")]
    QuotaExceeded(String),

    /// Authenticated user does not own the allocation
    #[error("Allocation owned by another user")]
    WrongOwner,

    /// Channel number bound to a different peer
    #[error("Channel 0x{0:04x} already bound to another peer")]
    ChannelInUse(u16),

    /// Peer already bound to a different channel
    #[error("Peer {0} already bound to another channel")]
    PeerAlreadyBound(std::net::SocketAddr),

    /// Channel number outside 0x4000..=0x7FFF
    #[error("Invalid channel number 0x{0:04x}")]
    InvalidChannel(u16),
}

impl AllocError {
    /// STUN error code sent to the requester
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AllocError::AllocationMismatch | AllocError::NotFound => ErrorCode::ALLOCATION_MISMATCH,
            AllocError::InsufficientCapacity => ErrorCode::INSUFFICIENT_CAPACITY,
            AllocError::QuotaExceeded(_) => ErrorCode::ALLOCATION_QUOTA_REACHED,
            AllocError::WrongOwner => ErrorCode::UNAUTHORIZED,
            AllocError::ChannelInUse(_)
            | AllocError::PeerAlreadyBound(_)
            | AllocError::InvalidChannel(_) => ErrorCode::BAD_REQUEST,
        }
    }
}

/// Long-term credential failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// USERNAME, REALM, NONCE or MESSAGE-INTEGRITY absent
    #[error("Missing credentials")]
    MissingCredentials,

    /// Nonce unknown for this client or past its lifetime
    #[error("Stale nonce")]
    StaleNonce,

    #[error("Realm mismatch: {0}")]
    WrongRealm(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Message integrity check failed for {0}")]
    IntegrityMismatch(String),
}

impl AuthError {
    /// STUN error code of the challenge
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AuthError::StaleNonce => ErrorCode::STALE_NONCE,
            _ => ErrorCode::UNAUTHORIZED,
        }
    }
}

/// Media relay error
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or truncated message
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// Credential challenge failed
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Allocation, quota or channel conflict
    #[error("Resource error: {0}")]
    Resource(#[from] AllocError),

    /// Socket I/O failure
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// REQUESTED-TRANSPORT other than UDP
    #[error("Unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// Configuration could not be loaded or used
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal bookkeeping broke for one allocation
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl RelayError {
    /// STUN error code sent when this error ends a request
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RelayError::Protocol(_) | RelayError::InvalidRequest(_) => ErrorCode::BAD_REQUEST,
            RelayError::Auth(e) => e.error_code(),
            RelayError::Resource(e) => e.error_code(),
            RelayError::UnsupportedTransport(_) => ErrorCode::UNSUPPORTED_TRANSPORT,
            RelayError::NetworkError(_)
            | RelayError::Config(_)
            | RelayError::InvariantViolation(_) => ErrorCode::SERVER_ERROR,
        }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
