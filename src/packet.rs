// Copyright 2024 the framewire authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Length-prefixed TLV packing.
//!
//! The default wire format is big-endian `msgId | dataLen | payload`. A
//! legacy variant with little-endian, reversed header fields exists for
//! old deployments and is selectable through [`packet_factory`].

use std::sync::Arc;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::FramewireError;
use crate::error::Result;
use crate::message::Message;
use crate::message::MsgHeader;

/// Fixed header size: two unsigned 32-bit fields.
pub const TLV_HEADER_LEN: usize = 8;

/// A stateless, thread-safe message codec.
///
/// `unpack` parses the header only; the payload is read separately by the
/// caller using [`MsgHeader::len`].
pub trait Packet: Send + Sync {
  fn header_len(&self) -> usize;
  fn pack(&self, msg: &Message) -> Result<Bytes>;
  fn unpack(&self, header: &[u8]) -> Result<MsgHeader>;
}

/// Codec identifiers accepted by [`packet_factory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStyle {
  /// Big-endian `msgId | dataLen | payload`. The default.
  Tlv,
  /// Little-endian `dataLen | msgId | payload`. Legacy deployments only.
  LegacyTlv,
}

pub fn packet_factory(
  style: PacketStyle,
  max_packet_size: u32,
) -> Arc<dyn Packet> {
  match style {
    PacketStyle::Tlv => Arc::new(TlvPacket::new(max_packet_size)),
    PacketStyle::LegacyTlv => Arc::new(LegacyTlvPacket::new(max_packet_size)),
  }
}

fn check_len(len: u32, max_packet_size: u32) -> Result<()> {
  if max_packet_size > 0 && len > max_packet_size {
    return Err(FramewireError::FrameTooLarge {
      len: len as usize,
      max: max_packet_size as usize,
    });
  }
  Ok(())
}

/// The default big-endian codec.
#[derive(Debug, Clone)]
pub struct TlvPacket {
  max_packet_size: u32,
}

impl TlvPacket {
  pub fn new(max_packet_size: u32) -> Self {
    Self { max_packet_size }
  }
}

impl Packet for TlvPacket {
  fn header_len(&self) -> usize {
    TLV_HEADER_LEN
  }

  fn pack(&self, msg: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(TLV_HEADER_LEN + msg.data().len());
    buf.put_u32(msg.id());
    buf.put_u32(msg.data_len());
    buf.put_slice(msg.data());
    Ok(buf.freeze())
  }

  fn unpack(&self, header: &[u8]) -> Result<MsgHeader> {
    if header.len() < TLV_HEADER_LEN {
      return Err(FramewireError::InvalidHeader);
    }
    let id = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let len = u32::from_be_bytes(header[4..8].try_into().unwrap());
    check_len(len, self.max_packet_size)?;
    Ok(MsgHeader { id, len })
  }
}

/// The legacy little-endian codec with reversed header fields.
#[derive(Debug, Clone)]
pub struct LegacyTlvPacket {
  max_packet_size: u32,
}

impl LegacyTlvPacket {
  pub fn new(max_packet_size: u32) -> Self {
    Self { max_packet_size }
  }
}

impl Packet for LegacyTlvPacket {
  fn header_len(&self) -> usize {
    TLV_HEADER_LEN
  }

  fn pack(&self, msg: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(TLV_HEADER_LEN + msg.data().len());
    buf.put_u32_le(msg.data_len());
    buf.put_u32_le(msg.id());
    buf.put_slice(msg.data());
    Ok(buf.freeze())
  }

  fn unpack(&self, header: &[u8]) -> Result<MsgHeader> {
    if header.len() < TLV_HEADER_LEN {
      return Err(FramewireError::InvalidHeader);
    }
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let id = u32::from_le_bytes(header[4..8].try_into().unwrap());
    check_len(len, self.max_packet_size)?;
    Ok(MsgHeader { id, len })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pack_layout_is_big_endian_id_then_len() {
    let dp = TlvPacket::new(0);
    let msg = Message::new(7, &b"hello"[..]);
    let wire = dp.pack(&msg).unwrap();
    assert_eq!(&wire[0..4], &7u32.to_be_bytes());
    assert_eq!(&wire[4..8], &5u32.to_be_bytes());
    assert_eq!(&wire[8..], b"hello");
  }

  #[test]
  fn unpack_round_trips_header() {
    let dp = TlvPacket::new(4096);
    let msg = Message::new(100, &b"ping...ping...ping"[..]);
    let wire = dp.pack(&msg).unwrap();
    let head = dp.unpack(&wire[..TLV_HEADER_LEN]).unwrap();
    assert_eq!(head.id, msg.id());
    assert_eq!(head.len, msg.data_len());
  }

  #[test]
  fn unpack_accepts_max_and_rejects_above() {
    let dp = TlvPacket::new(16);
    let at_limit = dp.pack(&Message::new(1, vec![0u8; 16])).unwrap();
    assert!(dp.unpack(&at_limit[..TLV_HEADER_LEN]).is_ok());

    let over = dp.pack(&Message::new(1, vec![0u8; 17])).unwrap();
    let err = dp.unpack(&over[..TLV_HEADER_LEN]).unwrap_err();
    assert!(matches!(err, FramewireError::FrameTooLarge { len: 17, .. }));
  }

  #[test]
  fn unpack_rejects_short_header() {
    let dp = TlvPacket::new(0);
    assert!(matches!(
      dp.unpack(&[0, 1, 2]),
      Err(FramewireError::InvalidHeader)
    ));
  }

  #[test]
  fn legacy_layout_is_little_endian_len_then_id() {
    let dp = LegacyTlvPacket::new(0);
    let wire = dp.pack(&Message::new(2, &b"ab"[..])).unwrap();
    assert_eq!(&wire[0..4], &2u32.to_le_bytes());
    assert_eq!(&wire[4..8], &2u32.to_le_bytes());
    let head = dp.unpack(&wire).unwrap();
    assert_eq!(head, MsgHeader { id: 2, len: 2 });
  }
}
