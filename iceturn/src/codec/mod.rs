//! STUN/TURN wire codec
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


mod attribute;
mod channel_data;
mod framing;
mod message;

pub use attribute::{attr_type, Attribute, ErrorCode, PROTOCOL_TCP, PROTOCOL_UDP};
pub use channel_data::{is_valid_channel, ChannelData, MAX_CHANNEL, MIN_CHANNEL};
pub use framing::{Frame, StunFrameCodec};
pub use message::{
    decode, message_type, peek_header, Class, DecodedMessage, Message, Method, TransactionId,
    FINGERPRINT_XOR, HEADER_LEN, MAGIC_COOKIE,
};

/// What a packet on a shared socket looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    ChannelData,
    Unknown,
}

/// Demultiplex on the top two bits of the first byte
pub fn classify(buf: &[u8]) -> PacketKind {
    match buf.first().map(|b| b >> 6) {
        Some(0b00) => PacketKind::Stun,
        Some(0b01) => PacketKind::ChannelData,
        _ => PacketKind::Unknown,
    }
}
