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

//! Length-field-driven stream framing.
//!
//! TCP is a byte stream: one read may carry half a header, or three frames
//! and a partial tail. [`FrameDecoder`] accumulates arriving bytes and
//! yields complete frames; [`TlvDecoder`] is the chain stage that parses a
//! complete frame into a [`Message`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use bytes::BytesMut;
use tracing::error;

use crate::error::FramewireError;
use crate::error::Result;
use crate::interceptor::Chain;
use crate::interceptor::Interceptor;
use crate::message::Message;
use crate::packet::Packet;
use crate::packet::TlvPacket;
use crate::packet::TLV_HEADER_LEN;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrder {
  BigEndian,
  LittleEndian,
}

/// Describes where the length field sits inside a frame and how the full
/// frame length derives from it. The computation is
/// `field value + length_adjustment + length_field_offset +
/// length_field_length`, with `initial_bytes_to_strip` removed from every
/// emitted frame.
#[derive(Debug, Clone)]
pub struct LengthField {
  pub max_frame_length: usize,
  pub length_field_offset: usize,
  pub length_field_length: usize,
  pub length_adjustment: isize,
  pub initial_bytes_to_strip: usize,
  pub order: FieldOrder,
}

impl LengthField {
  /// The descriptor matching the default TLV codec: a big-endian length at
  /// offset 4, frames emitted with their 8-byte header intact.
  pub fn tlv(max_packet_size: u32) -> Self {
    let max_frame_length = if max_packet_size > 0 {
      max_packet_size as usize + TLV_HEADER_LEN
    } else {
      usize::MAX
    };
    Self {
      max_frame_length,
      length_field_offset: 4,
      length_field_length: 4,
      length_adjustment: 0,
      initial_bytes_to_strip: 0,
      order: FieldOrder::BigEndian,
    }
  }
}

/// Stateful per-connection frame reassembler.
pub struct FrameDecoder {
  field: LengthField,
  buf: BytesMut,
}

impl FrameDecoder {
  pub fn new(field: LengthField) -> Self {
    Self {
      field,
      buf: BytesMut::new(),
    }
  }

  /// Appends `data` to the internal buffer and drains every complete
  /// frame. Any remainder stays buffered for the next call.
  pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
    self.buf.extend_from_slice(data);

    let field_end =
      self.field.length_field_offset + self.field.length_field_length;
    let mut frames = Vec::new();

    loop {
      if self.buf.len() < field_end {
        break;
      }
      let value = self.read_field_value();
      let frame_len = value as i128
        + self.field.length_adjustment as i128
        + field_end as i128;
      if frame_len < field_end as i128 {
        return Err(FramewireError::InvalidHeader);
      }
      let frame_len = frame_len as usize;
      if frame_len > self.field.max_frame_length {
        return Err(FramewireError::FrameTooLarge {
          len: frame_len,
          max: self.field.max_frame_length,
        });
      }
      if self.buf.len() < frame_len {
        break;
      }
      let mut frame = self.buf.split_to(frame_len);
      if self.field.initial_bytes_to_strip > 0 {
        if self.field.initial_bytes_to_strip > frame.len() {
          return Err(FramewireError::InvalidHeader);
        }
        let _ = frame.split_to(self.field.initial_bytes_to_strip);
      }
      frames.push(frame.freeze());
    }

    Ok(frames)
  }

  fn read_field_value(&self) -> u64 {
    let start = self.field.length_field_offset;
    let raw = &self.buf[start..start + self.field.length_field_length];
    let mut value: u64 = 0;
    match self.field.order {
      FieldOrder::BigEndian => {
        for b in raw {
          value = (value << 8) | u64::from(*b);
        }
      }
      FieldOrder::LittleEndian => {
        for b in raw.iter().rev() {
          value = (value << 8) | u64::from(*b);
        }
      }
    }
    value
  }
}

/// A chain stage that turns a complete frame into a parsed [`Message`].
///
/// Injected as the first stage of the interceptor chain; the dispatcher is
/// the terminal stage.
pub trait Decoder: Interceptor {
  fn length_field(&self) -> Option<LengthField>;
}

pub struct TlvDecoder {
  packet: Arc<dyn Packet>,
  field: LengthField,
}

impl TlvDecoder {
  pub fn new(packet: Arc<dyn Packet>, field: LengthField) -> Self {
    Self { packet, field }
  }

  /// The decoder for the default big-endian TLV codec.
  pub fn tlv(max_packet_size: u32) -> Self {
    Self::new(
      Arc::new(TlvPacket::new(max_packet_size)),
      LengthField::tlv(max_packet_size),
    )
  }
}

#[async_trait]
impl Interceptor for TlvDecoder {
  async fn intercept(&self, chain: Chain) -> Option<Request> {
    let frame = chain.request().message().data_bytes().clone();
    let header_len = self.packet.header_len();
    if frame.len() < header_len {
      // Not a framed payload; pass through untouched.
      return chain.proceed().await;
    }
    let header = match self.packet.unpack(&frame[..header_len]) {
      Ok(header) => header,
      Err(err) => {
        error!(?err, "dropping undecodable frame");
        chain.request().connection().stop();
        return None;
      }
    };
    let payload = frame.slice(header_len..);
    if payload.len() as u32 != header.len {
      error!(
        declared = header.len,
        actual = payload.len(),
        "frame length mismatch"
      );
      chain.request().connection().stop();
      return None;
    }
    let message = Message::new(header.id, payload.clone());
    chain
      .proceed_with_message(message, Some(Box::new(payload)))
      .await
  }
}

impl Decoder for TlvDecoder {
  fn length_field(&self) -> Option<LengthField> {
    Some(self.field.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Message;
  use crate::packet::TlvPacket;

  fn tlv_frame(id: u32, data: &[u8]) -> Bytes {
    TlvPacket::new(0).pack(&Message::new(id, data.to_vec())).unwrap()
  }

  #[test]
  fn reassembles_a_frame_split_across_every_byte() {
    let wire = tlv_frame(1, b"fragmented");
    let mut dec = FrameDecoder::new(LengthField::tlv(4096));
    let mut out = Vec::new();
    for b in wire.iter() {
      out.extend(dec.decode(std::slice::from_ref(b)).unwrap());
    }
    assert_eq!(out, vec![wire]);
  }

  #[test]
  fn drains_coalesced_frames_in_order_with_no_remainder() {
    let a = tlv_frame(1, b"wireTest");
    let b = tlv_frame(2, "\u{4f60}\u{597d}!!!".as_bytes());
    let mut joined = a.to_vec();
    joined.extend_from_slice(&b);

    let mut dec = FrameDecoder::new(LengthField::tlv(4096));
    let frames = dec.decode(&joined).unwrap();
    assert_eq!(frames, vec![a, b]);
    assert!(dec.decode(&[]).unwrap().is_empty());
  }

  #[test]
  fn keeps_partial_tail_buffered() {
    let a = tlv_frame(7, b"first");
    let b = tlv_frame(8, b"second");
    let mut joined = a.to_vec();
    joined.extend_from_slice(&b);
    let (now, later) = joined.split_at(a.len() + 3);

    let mut dec = FrameDecoder::new(LengthField::tlv(4096));
    assert_eq!(dec.decode(now).unwrap(), vec![a]);
    assert_eq!(dec.decode(later).unwrap(), vec![b]);
  }

  #[test]
  fn frame_at_limit_passes_and_one_past_fails() {
    let mut dec = FrameDecoder::new(LengthField::tlv(16));
    let ok = tlv_frame(1, &[0u8; 16]);
    assert_eq!(dec.decode(&ok).unwrap().len(), 1);

    let over = tlv_frame(1, &[0u8; 17]);
    assert!(matches!(
      dec.decode(&over),
      Err(FramewireError::FrameTooLarge { .. })
    ));
  }

  #[test]
  fn strips_initial_bytes_when_configured() {
    let field = LengthField {
      initial_bytes_to_strip: TLV_HEADER_LEN,
      ..LengthField::tlv(4096)
    };
    let mut dec = FrameDecoder::new(field);
    let frames = dec.decode(&tlv_frame(9, b"payload")).unwrap();
    assert_eq!(frames, vec![Bytes::from_static(b"payload")]);
  }

  #[test]
  fn reads_little_endian_length_fields() {
    let field = LengthField {
      length_field_offset: 0,
      length_field_length: 2,
      order: FieldOrder::LittleEndian,
      ..LengthField::tlv(4096)
    };
    let mut dec = FrameDecoder::new(field);
    // 3-byte payload, 2-byte LE length prefix.
    let frames = dec.decode(&[3, 0, b'a', b'b', b'c']).unwrap();
    assert_eq!(frames, vec![Bytes::from_static(&[3, 0, b'a', b'b', b'c'])]);
  }
}
