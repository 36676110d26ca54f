//! STUN message framing, MESSAGE-INTEGRITY and FINGERPRINT
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


use super::attribute::{attr_type, padding, Attribute, ErrorCode};
use crate::error::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;
use std::net::SocketAddr;

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;
/// Fixed header size
pub const HEADER_LEN: usize = 20;
/// XOR-ed into the CRC-32 of FINGERPRINT
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

const INTEGRITY_ATTR_LEN: usize = 4 + 20;
const FINGERPRINT_ATTR_LEN: usize = 4 + 4;

/// STUN/TURN method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    /// Any method this server does not implement
    Unknown(u16),
}

impl Method {
    pub fn from_bits(bits: u16) -> Self {
        match bits {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x009 => Method::ChannelBind,
            other => Method::Unknown(other),
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
            Method::Unknown(bits) => bits & 0x0FFF,
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0x0000,
            Class::Indication => 0x0010,
            Class::SuccessResponse => 0x0100,
            Class::ErrorResponse => 0x0110,
        }
    }

    fn from_type(message_type: u16) -> Self {
        match message_type & 0x0110 {
            0x0000 => Class::Request,
            0x0010 => Class::Indication,
            0x0100 => Class::SuccessResponse,
            _ => Class::ErrorResponse,
        }
    }
}

/// Interleave method and class bits into the 14-bit message type
pub fn message_type(method: Method, class: Class) -> u16 {
    let m = method.bits();
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | class.bits()
}

fn split_message_type(message_type: u16) -> (Method, Class) {
    let bits = (message_type & 0x000F) | ((message_type & 0x00E0) >> 1) | ((message_type & 0x3E00) >> 2);
    (Method::from_bits(bits), Class::from_type(message_type))
}

/// 96-bit transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn new(bytes: [u8; 12]) -> Self {
        TransactionId(bytes)
    }

    pub fn random() -> Self {
        TransactionId(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: Method,
    pub class: Class,
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(method: Method, class: Class, transaction_id: TransactionId) -> Self {
        Message {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Request with a fresh transaction id
    pub fn request(method: Method) -> Self {
        Message::new(method, Class::Request, TransactionId::random())
    }

    /// Indication with a fresh transaction id
    pub fn indication(method: Method) -> Self {
        Message::new(method, Class::Indication, TransactionId::random())
    }

    /// Success response sharing the request's method and transaction id
    pub fn success_for(request: &Message) -> Self {
        Message::new(request.method, Class::SuccessResponse, request.transaction_id)
    }

    /// Error response carrying ERROR-CODE
    pub fn error_for(request: &Message, error: ErrorCode) -> Self {
        Message::new(request.method, Class::ErrorResponse, request.transaction_id)
            .with(Attribute::ErrorCode(error))
    }

    /// Append an attribute
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn push(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// LIFETIME in seconds
    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn requested_transport(&self) -> Option<u8> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::RequestedTransport(p) => Some(*p),
            _ => None,
        })
    }

    pub fn channel_number(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ChannelNumber(c) => Some(*c),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(d) => Some(d),
            _ => None,
        })
    }

    pub fn error_code(&self) -> Option<&ErrorCode> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode(e) => Some(e),
            _ => None,
        })
    }

    /// All XOR-PEER-ADDRESS values (CreatePermission may carry several)
    pub fn xor_peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::XorPeerAddress(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn has_fingerprint(&self) -> bool {
        self.attributes.iter().any(|a| matches!(a, Attribute::Fingerprint(_)))
    }

    /// Encode without MESSAGE-INTEGRITY or FINGERPRINT
    pub fn encode(&self) -> Bytes {
        self.encode_with(None, false)
    }

    /// Encode, appending MESSAGE-INTEGRITY under `integrity_key` and
    /// FINGERPRINT when asked
    pub fn encode_with(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.put_u16(message_type(self.method, self.class));
        buf.put_u16(0);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attribute in &self.attributes {
            if matches!(
                attribute,
                Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)
            ) {
                continue;
            }
            attribute.encode(&mut buf, &self.transaction_id);
        }

        if let Some(key) = integrity_key {
            let length = buf.len() - HEADER_LEN + INTEGRITY_ATTR_LEN;
            set_length(&mut buf, length);
            let tag = hmac_sha1(key, &buf);
            Attribute::MessageIntegrity(tag).encode(&mut buf, &self.transaction_id);
        }

        if fingerprint {
            let length = buf.len() - HEADER_LEN + FINGERPRINT_ATTR_LEN;
            set_length(&mut buf, length);
            let crc = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;
            Attribute::Fingerprint(crc).encode(&mut buf, &self.transaction_id);
        }

        let length = buf.len() - HEADER_LEN;
        set_length(&mut buf, length);
        buf.freeze()
    }
}

fn set_length(buf: &mut BytesMut, length: usize) {
    buf[2..4].copy_from_slice(&(length as u16).to_be_bytes());
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// A message as received, with what is needed to verify it
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub message: Message,
    /// Comprehension-optional and -required types this codec skipped
    pub unknown_attributes: Vec<u16>,
    raw: Bytes,
    integrity_offset: Option<usize>,
}

impl DecodedMessage {
    /// Exact bytes of the message
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn has_integrity(&self) -> bool {
        self.integrity_offset.is_some()
    }

    /// Skipped attributes the sender required us to understand
    pub fn unknown_comprehension_required(&self) -> Vec<u16> {
        self.unknown_attributes
            .iter()
            .copied()
            .filter(|t| attr_type::is_comprehension_required(*t))
            .collect()
    }

    /// Check MESSAGE-INTEGRITY against `key`
    ///
    /// The HMAC covers everything before the attribute with the header
    /// length rewritten to end right after it.
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        let Some(offset) = self.integrity_offset else {
            return false;
        };
        let mut covered = self.raw[..offset].to_vec();
        let length = (offset - HEADER_LEN + INTEGRITY_ATTR_LEN) as u16;
        covered[2..4].copy_from_slice(&length.to_be_bytes());

        let tag = &self.raw[offset + 4..offset + INTEGRITY_ATTR_LEN];
        let mut mac = match HmacSha1::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(&covered);
        mac.verify_slice(tag).is_ok()
    }
}

/// Read method, class and transaction id without parsing attributes
///
/// Lets the caller answer 400 to a request whose attributes are broken.
pub fn peek_header(buf: &[u8]) -> Option<(Method, Class, TransactionId)> {
    if buf.len() < HEADER_LEN || buf[0] & 0xC0 != 0 {
        return None;
    }
    if u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) != MAGIC_COOKIE {
        return None;
    }
    let (method, class) = split_message_type(u16::from_be_bytes([buf[0], buf[1]]));
    let mut tid = [0u8; 12];
    tid.copy_from_slice(&buf[8..20]);
    Some((method, class, TransactionId::new(tid)))
}

/// Decode one message from the front of `buf`, returning the bytes after it
pub fn decode(buf: &[u8]) -> CodecResult<(DecodedMessage, &[u8])> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::TruncatedMessage {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    if buf[0] & 0xC0 != 0 {
        return Err(CodecError::MalformedHeader(
            "leading two bits must be zero".to_string(),
        ));
    }
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(CodecError::MalformedHeader(format!(
            "bad magic cookie 0x{:08x}",
            cookie
        )));
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length % 4 != 0 {
        return Err(CodecError::MalformedHeader(format!(
            "length {} is not a multiple of 4",
            length
        )));
    }
    let total = HEADER_LEN + length;
    if buf.len() < total {
        return Err(CodecError::TruncatedMessage {
            needed: total,
            available: buf.len(),
        });
    }

    let (method, class) = split_message_type(u16::from_be_bytes([buf[0], buf[1]]));
    let mut tid = [0u8; 12];
    tid.copy_from_slice(&buf[8..20]);
    let transaction_id = TransactionId::new(tid);

    let mut message = Message::new(method, class, transaction_id);
    let mut unknown_attributes = Vec::new();
    let mut integrity_offset = None;
    let mut seen_fingerprint = false;
    let mut offset = HEADER_LEN;

    while offset < total {
        if offset + 4 > total {
            return Err(CodecError::MalformedHeader(
                "trailing bytes shorter than an attribute header".to_string(),
            ));
        }
        let kind = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + len;
        if value_end > total {
            return Err(CodecError::MalformedAttribute {
                attr_type: kind,
                reason: "attribute overruns message".to_string(),
            });
        }
        if seen_fingerprint {
            return Err(CodecError::MalformedAttribute {
                attr_type: kind,
                reason: "attribute after FINGERPRINT".to_string(),
            });
        }
        let value = &buf[value_start..value_end];

        if kind == attr_type::FINGERPRINT {
            let received = match <[u8; 4]>::try_from(value) {
                Ok(bytes) => u32::from_be_bytes(bytes),
                Err(_) => {
                    return Err(CodecError::MalformedAttribute {
                        attr_type: kind,
                        reason: format!("expected 4 bytes, got {}", value.len()),
                    })
                }
            };
            let expected = crc32fast::hash(&buf[..offset]) ^ FINGERPRINT_XOR;
            if received != expected {
                return Err(CodecError::MalformedAttribute {
                    attr_type: kind,
                    reason: "fingerprint mismatch".to_string(),
                });
            }
            message.push(Attribute::Fingerprint(received));
            seen_fingerprint = true;
        } else if integrity_offset.is_some() {
            // Only FINGERPRINT may follow MESSAGE-INTEGRITY; the rest is ignored
        } else {
            match Attribute::decode(kind, value, &transaction_id)? {
                Some(attribute) => {
                    if kind == attr_type::MESSAGE_INTEGRITY {
                        integrity_offset = Some(offset);
                    }
                    message.push(attribute);
                }
                None => unknown_attributes.push(kind),
            }
        }

        offset = value_end + padding(len);
    }

    let decoded = DecodedMessage {
        message,
        unknown_attributes,
        raw: Bytes::copy_from_slice(&buf[..total]),
        integrity_offset,
    };
    Ok((decoded, &buf[total..]))
}
