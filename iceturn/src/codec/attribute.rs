//! STUN/TURN attributes
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


use super::message::{TransactionId, MAGIC_COOKIE};
use crate::error::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Attribute type numbers (RFC 5389, RFC 5766)
pub mod attr_type {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const DONT_FRAGMENT: u16 = 0x001A;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;

    /// Types below 0x8000 must be understood by the receiver
    pub fn is_comprehension_required(attr_type: u16) -> bool {
        attr_type < 0x8000
    }
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Protocol number carried in REQUESTED-TRANSPORT for UDP
pub const PROTOCOL_UDP: u8 = 17;
/// Protocol number carried in REQUESTED-TRANSPORT for TCP
pub const PROTOCOL_TCP: u8 = 6;

/// ERROR-CODE value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u16,
    pub reason: Cow<'static, str>,
}

impl ErrorCode {
    pub const BAD_REQUEST: ErrorCode = ErrorCode::from_static(400, "Bad Request");
    pub const UNAUTHORIZED: ErrorCode = ErrorCode::from_static(401, "Unauthorized");
    pub const UNKNOWN_ATTRIBUTE: ErrorCode = ErrorCode::from_static(420, "Unknown Attribute");
    pub const ALLOCATION_MISMATCH: ErrorCode = ErrorCode::from_static(437, "Allocation Mismatch");
    pub const STALE_NONCE: ErrorCode = ErrorCode::from_static(438, "Stale Nonce");
    pub const UNSUPPORTED_TRANSPORT: ErrorCode =
        ErrorCode::from_static(442, "Unsupported Transport Protocol");
    pub const ALLOCATION_QUOTA_REACHED: ErrorCode =
        ErrorCode::from_static(486, "Allocation Quota Reached");
    pub const SERVER_ERROR: ErrorCode = ErrorCode::from_static(500, "Server Error");
    pub const INSUFFICIENT_CAPACITY: ErrorCode = ErrorCode::from_static(508, "Insufficient Capacity");

    pub const fn from_static(code: u16, reason: &'static str) -> Self {
        ErrorCode {
            code,
            reason: Cow::Borrowed(reason),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// A decoded STUN/TURN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    /// Lifetime in seconds
    Lifetime(u32),
    Username(String),
    Realm(String),
    Nonce(String),
    /// HMAC-SHA1 tag; produced by `Message::encode_with`, never copied on encode
    MessageIntegrity([u8; 20]),
    ErrorCode(ErrorCode),
    UnknownAttributes(Vec<u16>),
    ChannelNumber(u16),
    Data(Bytes),
    /// IANA protocol number (17 = UDP)
    RequestedTransport(u8),
    DontFragment,
    Software(String),
    /// CRC-32 value; produced by `Message::encode_with`, never copied on encode
    Fingerprint(u32),
}

impl Attribute {
    /// Attribute type number
    pub fn attr_type(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => attr_type::MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => attr_type::XOR_MAPPED_ADDRESS,
            Attribute::XorRelayedAddress(_) => attr_type::XOR_RELAYED_ADDRESS,
            Attribute::XorPeerAddress(_) => attr_type::XOR_PEER_ADDRESS,
            Attribute::Lifetime(_) => attr_type::LIFETIME,
            Attribute::Username(_) => attr_type::USERNAME,
            Attribute::Realm(_) => attr_type::REALM,
            Attribute::Nonce(_) => attr_type::NONCE,
            Attribute::MessageIntegrity(_) => attr_type::MESSAGE_INTEGRITY,
            Attribute::ErrorCode(_) => attr_type::ERROR_CODE,
            Attribute::UnknownAttributes(_) => attr_type::UNKNOWN_ATTRIBUTES,
            Attribute::ChannelNumber(_) => attr_type::CHANNEL_NUMBER,
            Attribute::Data(_) => attr_type::DATA,
            Attribute::RequestedTransport(_) => attr_type::REQUESTED_TRANSPORT,
            Attribute::DontFragment => attr_type::DONT_FRAGMENT,
            Attribute::Software(_) => attr_type::SOFTWARE,
            Attribute::Fingerprint(_) => attr_type::FINGERPRINT,
        }
    }

    /// Append type, length, value and padding to `buf`
    pub(crate) fn encode(&self, buf: &mut BytesMut, transaction_id: &TransactionId) {
        let mut value = BytesMut::new();
        match self {
            Attribute::MappedAddress(addr) => encode_address(&mut value, *addr),
            Attribute::XorMappedAddress(addr)
            | Attribute::XorRelayedAddress(addr)
            | Attribute::XorPeerAddress(addr) => {
                encode_address(&mut value, xor_address(*addr, transaction_id))
            }
            Attribute::Lifetime(secs) => value.put_u32(*secs),
            Attribute::Username(s)
            | Attribute::Realm(s)
            | Attribute::Nonce(s)
            | Attribute::Software(s) => value.put_slice(s.as_bytes()),
            Attribute::MessageIntegrity(tag) => value.put_slice(tag),
            Attribute::ErrorCode(error) => {
                value.put_u16(0);
                value.put_u8(((error.code / 100) & 0x07) as u8);
                value.put_u8((error.code % 100) as u8);
                value.put_slice(error.reason.as_bytes());
            }
            Attribute::UnknownAttributes(types) => {
                for t in types {
                    value.put_u16(*t);
                }
            }
            Attribute::ChannelNumber(channel) => {
                value.put_u16(*channel);
                value.put_u16(0);
            }
            Attribute::Data(data) => value.put_slice(data),
            Attribute::RequestedTransport(protocol) => {
                value.put_u8(*protocol);
                value.put_slice(&[0, 0, 0]);
            }
            Attribute::DontFragment => {}
            Attribute::Fingerprint(crc) => value.put_u32(*crc),
        }

        buf.put_u16(self.attr_type());
        buf.put_u16(value.len() as u16);
        buf.put_slice(&value);
        buf.put_bytes(0, padding(value.len()));
    }

    /// Decode one attribute value; `Ok(None)` for types this codec does not know
    pub(crate) fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> CodecResult<Option<Attribute>> {
        let attribute = match attr_type {
            attr_type::MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(attr_type, value)?),
            attr_type::XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(xor_address(
                decode_address(attr_type, value)?,
                transaction_id,
            )),
            attr_type::XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(xor_address(
                decode_address(attr_type, value)?,
                transaction_id,
            )),
            attr_type::XOR_PEER_ADDRESS => Attribute::XorPeerAddress(xor_address(
                decode_address(attr_type, value)?,
                transaction_id,
            )),
            attr_type::LIFETIME => Attribute::Lifetime(read_u32(attr_type, value)?),
            attr_type::USERNAME => Attribute::Username(read_string(attr_type, value)?),
            attr_type::REALM => Attribute::Realm(read_string(attr_type, value)?),
            attr_type::NONCE => Attribute::Nonce(read_string(attr_type, value)?),
            attr_type::SOFTWARE => Attribute::Software(read_string(attr_type, value)?),
            attr_type::MESSAGE_INTEGRITY => {
                let tag: [u8; 20] = value
                    .try_into()
                    .map_err(|_| malformed(attr_type, "MESSAGE-INTEGRITY must be 20 bytes"))?;
                Attribute::MessageIntegrity(tag)
            }
            attr_type::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(malformed(attr_type, "ERROR-CODE shorter than 4 bytes"));
                }
                let class = u16::from(value[2] & 0x07);
                let number = u16::from(value[3]);
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(malformed(attr_type, "error class or number out of range"));
                }
                Attribute::ErrorCode(ErrorCode {
                    code: class * 100 + number,
                    reason: Cow::Owned(read_string(attr_type, &value[4..])?),
                })
            }
            attr_type::UNKNOWN_ATTRIBUTES => {
                if value.len() % 2 != 0 {
                    return Err(malformed(attr_type, "odd UNKNOWN-ATTRIBUTES length"));
                }
                Attribute::UnknownAttributes(
                    value
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            attr_type::CHANNEL_NUMBER => {
                if value.len() != 4 {
                    return Err(malformed(attr_type, "CHANNEL-NUMBER must be 4 bytes"));
                }
                Attribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            attr_type::DATA => Attribute::Data(Bytes::copy_from_slice(value)),
            attr_type::REQUESTED_TRANSPORT => {
                if value.len() != 4 {
                    return Err(malformed(attr_type, "REQUESTED-TRANSPORT must be 4 bytes"));
                }
                Attribute::RequestedTransport(value[0])
            }
            attr_type::DONT_FRAGMENT => Attribute::DontFragment,
            attr_type::FINGERPRINT => Attribute::Fingerprint(read_u32(attr_type, value)?),
            _ => return Ok(None),
        };
        Ok(Some(attribute))
    }
}

/// Bytes of padding needed to reach a 4-byte boundary
pub(crate) fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn malformed(attr_type: u16, reason: &str) -> CodecError {
    CodecError::MalformedAttribute {
        attr_type,
        reason: reason.to_string(),
    }
}

fn read_u32(attr_type: u16, value: &[u8]) -> CodecResult<u32> {
    let raw: [u8; 4] = value
        .try_into()
        .map_err(|_| malformed(attr_type, "expected 4 bytes"))?;
    Ok(u32::from_be_bytes(raw))
}

fn read_string(attr_type: u16, value: &[u8]) -> CodecResult<String> {
    String::from_utf8(value.to_vec()).map_err(|_| malformed(attr_type, "invalid UTF-8"))
}

/// Encode address for MAPPED-ADDRESS style attributes
fn encode_address(buf: &mut BytesMut, addr: SocketAddr) {
    // Reserved (1 byte) + Family (1 byte) + Port (2 bytes) + Address (4 or 16 bytes)
    buf.put_u8(0);
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(v4.port());
            buf.put_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(v6.port());
            buf.put_slice(&v6.ip().octets());
        }
    }
}

fn decode_address(attr_type: u16, value: &[u8]) -> CodecResult<SocketAddr> {
    if value.len() < 4 {
        return Err(malformed(attr_type, "address shorter than 4 bytes"));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        FAMILY_IPV4 if value.len() == 8 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        FAMILY_IPV6 if value.len() == 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(malformed(attr_type, "unknown address family or length")),
    }
}

/// XOR an address with the magic cookie and transaction id; applying it twice
/// yields the original address
pub(crate) fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (o, c) in octets.iter_mut().zip(cookie.iter()) {
                *o ^= c;
            }
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        IpAddr::V6(ip) => {
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&cookie);
            mask[4..].copy_from_slice(transaction_id.as_bytes());
            let mut octets = ip.octets();
            for (o, m) in octets.iter_mut().zip(mask.iter()) {
                *o ^= m;
            }
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_address_ipv4_known_vector() {
        // RFC 5769 section 2.2: 192.0.2.1:32853
        let tid = TransactionId::new([0; 12]);
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let mut buf = BytesMut::new();
        Attribute::XorMappedAddress(addr).encode(&mut buf, &tid);
        assert_eq!(
            &buf[..],
            &[0x00, 0x20, 0x00, 0x08, 0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]
        );
    }

    #[test]
    fn test_xor_address_ipv6_uses_transaction_id() {
        let tid = TransactionId::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let addr: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        let mut buf = BytesMut::new();
        Attribute::XorPeerAddress(addr).encode(&mut buf, &tid);
        let decoded = Attribute::decode(attr_type::XOR_PEER_ADDRESS, &buf[4..], &tid)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, Attribute::XorPeerAddress(addr));

        let other = TransactionId::new([0; 12]);
        let misread = Attribute::decode(attr_type::XOR_PEER_ADDRESS, &buf[4..], &other)
            .unwrap()
            .unwrap();
        assert_ne!(misread, Attribute::XorPeerAddress(addr));
    }

    #[test]
    fn test_error_code_layout() {
        let tid = TransactionId::new([0; 12]);
        let mut buf = BytesMut::new();
        Attribute::ErrorCode(ErrorCode::STALE_NONCE).encode(&mut buf, &tid);
        assert_eq!(&buf[4..8], &[0, 0, 4, 38]);
        // "Stale Nonce" is 11 bytes: 4 + 11 = 15, padded to 16
        assert_eq!(buf.len(), 4 + 16);
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let tid = TransactionId::new([0; 12]);
        assert!(Attribute::decode(0x0024, &[0, 0, 0, 1], &tid).unwrap().is_none());
    }

    #[test]
    fn test_bad_address_family_is_malformed() {
        let tid = TransactionId::new([0; 12]);
        let err = Attribute::decode(attr_type::XOR_PEER_ADDRESS, &[0, 9, 0, 1, 1, 2, 3, 4], &tid);
        assert!(matches!(err, Err(CodecError::MalformedAttribute { .. })));
    }
}
