//! ChannelData framing (RFC 5766 section 11.4)
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


use super::attribute::padding;
use crate::error::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Channel number + length
pub const CHANNEL_HEADER_LEN: usize = 4;
pub const MIN_CHANNEL: u16 = 0x4000;
pub const MAX_CHANNEL: u16 = 0x7FFF;

pub fn is_valid_channel(channel: u16) -> bool {
    (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel)
}

/// Application data on a bound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel number
    pub channel: u16,
    /// Payload
    pub data: Bytes,
}

impl ChannelData {
    pub fn new(channel: u16, data: Bytes) -> Self {
        ChannelData { channel, data }
    }

    /// Bytes this frame occupies on the wire
    pub fn wire_len(&self, padded: bool) -> usize {
        let len = CHANNEL_HEADER_LEN + self.data.len();
        if padded {
            len + padding(self.data.len())
        } else {
            len
        }
    }

    /// Encode; stream transports pad the frame to a multiple of 4
    pub fn encode(&self, padded: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len(padded));
        self.encode_into(&mut buf, padded);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut, padded: bool) {
        buf.put_u16(self.channel);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        if padded {
            buf.put_bytes(0, padding(self.data.len()));
        }
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns the frame and the number of bytes consumed. Datagrams may
    /// carry trailing bytes past the declared length; those are ignored.
    pub fn decode(buf: &[u8], padded: bool) -> CodecResult<(ChannelData, usize)> {
        if buf.len() < CHANNEL_HEADER_LEN {
            return Err(CodecError::TruncatedMessage {
                needed: CHANNEL_HEADER_LEN,
                available: buf.len(),
            });
        }
        let channel = u16::from_be_bytes([buf[0], buf[1]]);
        if !is_valid_channel(channel) {
            return Err(CodecError::MalformedHeader(format!(
                "channel number 0x{:04x} out of range",
                channel
            )));
        }
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let end = CHANNEL_HEADER_LEN + len;
        if buf.len() < end {
            return Err(CodecError::TruncatedMessage {
                needed: end,
                available: buf.len(),
            });
        }
        let consumed = if padded {
            (end + padding(len)).min(buf.len()).max(end)
        } else {
            end
        };
        Ok((
            ChannelData::new(channel, Bytes::copy_from_slice(&buf[CHANNEL_HEADER_LEN..end])),
            consumed,
        ))
    }
}
