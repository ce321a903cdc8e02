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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FramewireError>;

/// Errors surfaced by the framework.
///
/// Connection-local I/O and decode failures converge on reader/writer exit
/// and trigger the connection finalizer; send-side errors are returned to
/// the caller and leave the connection state untouched (except for
/// [`FramewireError::Io`] on a direct send, which the peer task will
/// observe on its next read).
#[derive(Debug, Error)]
pub enum FramewireError {
  #[error("connection closed")]
  ConnectionClosed,
  #[error("buffered send timed out")]
  SendTimeout,
  #[error("frame of {len} bytes exceeds the limit of {max}")]
  FrameTooLarge { len: usize, max: usize },
  #[error("frame header truncated")]
  InvalidHeader,
  #[error("unexpected EOF")]
  UnexpectedEof,
  #[error("invalid websocket frame: {0}")]
  InvalidFrame(&'static str),
  #[error("websocket handshake failed: {0}")]
  Handshake(String),
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
}
