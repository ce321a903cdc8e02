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

use bytes::Bytes;

/// One framed application datagram: a 32-bit message id plus an opaque
/// payload. The data length is always derived from the payload, so
/// `data_len() == data().len()` holds by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
  id: u32,
  data: Bytes,
}

impl Message {
  pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
    Self {
      id,
      data: data.into(),
    }
  }

  /// A message wrapping bytes that have not been through the codec yet.
  /// The reader uses this to hand raw frames to the interceptor chain,
  /// where a decoder stage replaces it with the parsed message.
  pub fn raw(data: impl Into<Bytes>) -> Self {
    Self {
      id: 0,
      data: data.into(),
    }
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn set_id(&mut self, id: u32) {
    self.id = id;
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn data_bytes(&self) -> &Bytes {
    &self.data
  }

  pub fn set_data(&mut self, data: impl Into<Bytes>) {
    self.data = data.into();
  }

  pub fn into_data(self) -> Bytes {
    self.data
  }

  pub fn data_len(&self) -> u32 {
    self.data.len() as u32
  }
}

/// The decoded fixed-size frame header. The payload is read separately by
/// the caller using `len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
  pub id: u32,
  pub len: u32,
}
