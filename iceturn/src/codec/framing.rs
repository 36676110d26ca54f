//! Stream framing for STUN messages and ChannelData over TCP
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
use super::channel_data::{ChannelData, CHANNEL_HEADER_LEN};
use super::message::HEADER_LEN;
use super::{classify, PacketKind};
use crate::error::CodecError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One unit read off a TCP control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Complete STUN message, undecoded
    Stun(Bytes),
    /// ChannelData frame with its padding consumed
    ChannelData(ChannelData),
}

/// Splits a byte stream on STUN and ChannelData boundaries
///
/// STUN messages are delimited by their header length. ChannelData frames
/// are delimited by their length field rounded up to a multiple of 4.
#[derive(Debug, Default, Clone, Copy)]
pub struct StunFrameCodec;

impl StunFrameCodec {
    pub fn new() -> Self {
        StunFrameCodec
    }
}

impl Decoder for StunFrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < CHANNEL_HEADER_LEN {
            return Ok(None);
        }
        let declared = u16::from_be_bytes([src[2], src[3]]) as usize;

        match classify(src) {
            PacketKind::Stun => {
                let total = HEADER_LEN + declared;
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                Ok(Some(Frame::Stun(src.split_to(total).freeze())))
            }
            PacketKind::ChannelData => {
                let total = CHANNEL_HEADER_LEN + declared + padding(declared);
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                let frame = src.split_to(total);
                let (data, _) = ChannelData::decode(&frame, true)?;
                Ok(Some(Frame::ChannelData(data)))
            }
            PacketKind::Unknown => {
                let first = src[0];
                src.advance(src.len());
                Err(CodecError::MalformedHeader(format!(
                    "unrecognized frame starting with 0x{:02x}",
                    first
                )))
            }
        }
    }
}

impl Encoder<Bytes> for StunFrameCodec {
    type Error = CodecError;

    /// Callers hand over frames already padded for the stream
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
