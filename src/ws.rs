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

//! Minimal RFC6455 transport layer.
//!
//! The framework only needs binary frames carrying the TLV payload plus
//! the control frames (ping/pong/close), so this stays deliberately small:
//! no permessage-deflate, no subprotocols, split read/write halves so the
//! connection's reader and writer tasks can own their side independently.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::Digest;
use sha1::Sha1;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::FramewireError;
use crate::error::Result;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HTTP_HEAD: usize = 8 * 1024;
const MAX_MESSAGE_SIZE: usize = 64 << 20;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
  Server,
  Client,
}

/// One delivered websocket event. Fragmented data messages are reassembled
/// before delivery.
pub(crate) enum WsEvent {
  Data(Vec<u8>),
  Ping(Vec<u8>),
  Pong,
  Close,
}

pub(crate) struct WsReadHalf {
  stream: Box<dyn AsyncRead + Send + Unpin>,
  role: Role,
  /// Bytes read past the HTTP head during the handshake.
  pending: Vec<u8>,
  pending_pos: usize,
  fragment: Option<Vec<u8>>,
}

impl WsReadHalf {
  fn new(
    stream: Box<dyn AsyncRead + Send + Unpin>,
    role: Role,
    pending: Vec<u8>,
  ) -> Self {
    Self {
      stream,
      role,
      pending,
      pending_pos: 0,
      fragment: None,
    }
  }

  async fn fill_exact(&mut self, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() && self.pending_pos < self.pending.len() {
      buf[filled] = self.pending[self.pending_pos];
      filled += 1;
      self.pending_pos += 1;
    }
    if self.pending_pos == self.pending.len() && !self.pending.is_empty() {
      self.pending = Vec::new();
      self.pending_pos = 0;
    }
    if filled < buf.len() {
      self.stream.read_exact(&mut buf[filled..]).await?;
    }
    Ok(())
  }

  /// Reads frames until a complete message or control event is available.
  pub(crate) async fn read_event(&mut self) -> Result<WsEvent> {
    loop {
      let mut head = [0u8; 2];
      self.fill_exact(&mut head).await?;

      let fin = head[0] & 0x80 != 0;
      if head[0] & 0x70 != 0 {
        return Err(FramewireError::InvalidFrame("reserved bits set"));
      }
      let opcode = head[0] & 0x0F;
      let masked = head[1] & 0x80 != 0;

      let length = match head[1] & 0x7F {
        126 => {
          let mut ext = [0u8; 2];
          self.fill_exact(&mut ext).await?;
          u16::from_be_bytes(ext) as usize
        }
        127 => {
          let mut ext = [0u8; 8];
          self.fill_exact(&mut ext).await?;
          u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
      };

      let is_control = opcode & 0x8 != 0;
      if is_control && !fin {
        return Err(FramewireError::InvalidFrame("fragmented control frame"));
      }
      if is_control && length > 125 {
        return Err(FramewireError::InvalidFrame("oversized control frame"));
      }
      if length >= MAX_MESSAGE_SIZE {
        return Err(FramewireError::FrameTooLarge {
          len: length,
          max: MAX_MESSAGE_SIZE,
        });
      }

      match self.role {
        Role::Server if !masked => {
          return Err(FramewireError::InvalidFrame(
            "client frames must be masked",
          ));
        }
        Role::Client if masked => {
          return Err(FramewireError::InvalidFrame(
            "server frames must not be masked",
          ));
        }
        _ => {}
      }

      let mask = if masked {
        let mut key = [0u8; 4];
        self.fill_exact(&mut key).await?;
        Some(key)
      } else {
        None
      };

      let mut payload = vec![0u8; length];
      self.fill_exact(&mut payload).await?;
      if let Some(key) = mask {
        unmask(&mut payload, key);
      }

      match opcode {
        OP_CONTINUATION => {
          let Some(fragment) = &mut self.fragment else {
            return Err(FramewireError::InvalidFrame(
              "continuation without a started message",
            ));
          };
          fragment.extend_from_slice(&payload);
          if fragment.len() >= MAX_MESSAGE_SIZE {
            return Err(FramewireError::FrameTooLarge {
              len: fragment.len(),
              max: MAX_MESSAGE_SIZE,
            });
          }
          if fin {
            return Ok(WsEvent::Data(self.fragment.take().unwrap()));
          }
        }
        OP_TEXT | OP_BINARY => {
          if self.fragment.is_some() {
            return Err(FramewireError::InvalidFrame(
              "data frame inside a fragmented message",
            ));
          }
          if fin {
            return Ok(WsEvent::Data(payload));
          }
          self.fragment = Some(payload);
        }
        OP_CLOSE => return Ok(WsEvent::Close),
        OP_PING => return Ok(WsEvent::Ping(payload)),
        OP_PONG => return Ok(WsEvent::Pong),
        _ => return Err(FramewireError::InvalidFrame("reserved opcode")),
      }
    }
  }
}

pub(crate) struct WsWriteHalf {
  stream: Box<dyn AsyncWrite + Send + Unpin>,
  role: Role,
}

impl WsWriteHalf {
  fn new(stream: Box<dyn AsyncWrite + Send + Unpin>, role: Role) -> Self {
    Self { stream, role }
  }

  async fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
    let mut head = [0u8; 14];
    head[0] = 0x80 | opcode;
    let mask_bit = if self.role == Role::Client { 0x80 } else { 0 };

    let mut head_len = 2;
    match payload.len() {
      n if n < 126 => head[1] = mask_bit | n as u8,
      n if n < 65536 => {
        head[1] = mask_bit | 126;
        head[2..4].copy_from_slice(&(n as u16).to_be_bytes());
        head_len = 4;
      }
      n => {
        head[1] = mask_bit | 127;
        head[2..10].copy_from_slice(&(n as u64).to_be_bytes());
        head_len = 10;
      }
    }

    if self.role == Role::Client {
      let key: [u8; 4] = rand::random();
      head[head_len..head_len + 4].copy_from_slice(&key);
      head_len += 4;
      let mut masked = payload.to_vec();
      unmask(&mut masked, key);
      self.stream.write_all(&head[..head_len]).await?;
      self.stream.write_all(&masked).await?;
    } else {
      self.stream.write_all(&head[..head_len]).await?;
      self.stream.write_all(payload).await?;
    }
    self.stream.flush().await?;
    Ok(())
  }

  pub(crate) async fn write_binary(&mut self, payload: &[u8]) -> Result<()> {
    self.write_frame(OP_BINARY, payload).await
  }

  pub(crate) async fn write_pong(&mut self, payload: &[u8]) -> Result<()> {
    self.write_frame(OP_PONG, payload).await
  }

  pub(crate) async fn write_close(&mut self) -> Result<()> {
    // 1000, normal closure.
    self.write_frame(OP_CLOSE, &1000u16.to_be_bytes()).await
  }

  pub(crate) async fn shutdown(&mut self) -> Result<()> {
    let _ = self.write_close().await;
    self.stream.shutdown().await?;
    Ok(())
  }
}

/// XOR (un)masking; the same transform in both directions.
pub(crate) fn unmask(payload: &mut [u8], key: [u8; 4]) {
  for (i, b) in payload.iter_mut().enumerate() {
    *b ^= key[i & 3];
  }
}

fn accept_key(key: &str) -> String {
  let mut sha = Sha1::new();
  sha.update(key.as_bytes());
  sha.update(WS_GUID.as_bytes());
  BASE64.encode(sha.finalize())
}

/// The parsed request line and headers of an upgrade request, handed to
/// the server's authentication hook.
pub struct UpgradeRequest {
  pub method: String,
  pub path: String,
  headers: Vec<(String, String)>,
}

impl UpgradeRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Reads an HTTP head off `stream`, returning `(head, leftover)` where
/// leftover is whatever arrived past the terminating blank line.
async fn read_http_head<S: AsyncRead + Unpin>(
  stream: &mut S,
) -> Result<(Vec<u8>, Vec<u8>)> {
  let mut buf = Vec::with_capacity(512);
  let mut chunk = [0u8; 512];
  loop {
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
      return Err(FramewireError::UnexpectedEof);
    }
    buf.extend_from_slice(&chunk[..n]);
    if let Some(end) = find_head_end(&buf) {
      let leftover = buf.split_off(end);
      return Ok((buf, leftover));
    }
    if buf.len() > MAX_HTTP_HEAD {
      return Err(FramewireError::Handshake("oversized http head".into()));
    }
  }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(head: &[u8]) -> Result<(String, Vec<(String, String)>)> {
  let text = std::str::from_utf8(head)
    .map_err(|_| FramewireError::Handshake("head is not utf-8".into()))?;
  let mut lines = text.split("\r\n");
  let start = lines
    .next()
    .ok_or_else(|| FramewireError::Handshake("empty head".into()))?
    .to_string();
  let mut headers = Vec::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    let Some((name, value)) = line.split_once(':') else {
      return Err(FramewireError::Handshake(format!(
        "malformed header line: {line}"
      )));
    };
    headers.push((name.trim().to_string(), value.trim().to_string()));
  }
  Ok((start, headers))
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Performs the server side of the upgrade and splits the stream into
/// websocket halves. `auth` may reject the request, which answers 403 and
/// fails the handshake.
pub(crate) async fn server_upgrade<S>(
  mut stream: S,
  auth: Option<&(dyn Fn(&UpgradeRequest) -> bool + Send + Sync)>,
) -> Result<(WsReadHalf, WsWriteHalf)>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let (head, leftover) = read_http_head(&mut stream).await?;
  let (start, headers) = parse_head(&head)?;

  let mut parts = start.split_whitespace();
  let method = parts.next().unwrap_or_default().to_string();
  let path = parts.next().unwrap_or_default().to_string();
  if method != "GET" {
    return Err(FramewireError::Handshake(format!(
      "unexpected method {method}"
    )));
  }

  let upgrade_ok = header(&headers, "Upgrade")
    .map(|v| v.eq_ignore_ascii_case("websocket"))
    .unwrap_or(false);
  let connection_ok = header(&headers, "Connection")
    .map(|v| v.to_ascii_lowercase().contains("upgrade"))
    .unwrap_or(false);
  let version_ok =
    header(&headers, "Sec-WebSocket-Version") == Some("13");
  let Some(key) = header(&headers, "Sec-WebSocket-Key") else {
    return Err(FramewireError::Handshake("missing websocket key".into()));
  };
  if !upgrade_ok || !connection_ok || !version_ok {
    return Err(FramewireError::Handshake(
      "not a websocket upgrade request".into(),
    ));
  }

  let request = UpgradeRequest {
    method,
    path,
    headers: headers.clone(),
  };
  if let Some(auth) = auth {
    if !auth(&request) {
      let _ = stream
        .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
        .await;
      return Err(FramewireError::Handshake(
        "upgrade rejected by authentication hook".into(),
      ));
    }
  }

  let accept = accept_key(key);
  let response = format!(
    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
  );
  stream.write_all(response.as_bytes()).await?;

  let (r, w) = tokio::io::split(stream);
  Ok((
    WsReadHalf::new(Box::new(r), Role::Server, leftover),
    WsWriteHalf::new(Box::new(w), Role::Server),
  ))
}

/// Performs the client side of the handshake against `host`.
pub(crate) async fn client_handshake<S>(
  mut stream: S,
  host: &str,
) -> Result<(WsReadHalf, WsWriteHalf)>
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  let key = BASE64.encode(rand::random::<[u8; 16]>());
  let request = format!(
    "GET / HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
  );
  stream.write_all(request.as_bytes()).await?;

  let (head, leftover) = read_http_head(&mut stream).await?;
  let (status, headers) = parse_head(&head)?;
  if !status.contains(" 101 ") {
    return Err(FramewireError::Handshake(format!(
      "unexpected status line: {status}"
    )));
  }
  let expected = accept_key(&key);
  if header(&headers, "Sec-WebSocket-Accept") != Some(expected.as_str()) {
    return Err(FramewireError::Handshake("bad accept key".into()));
  }

  let (r, w) = tokio::io::split(stream);
  Ok((
    WsReadHalf::new(Box::new(r), Role::Client, leftover),
    WsWriteHalf::new(Box::new(w), Role::Client),
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accept_key_matches_the_rfc_example() {
    assert_eq!(
      accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
      "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
  }

  #[test]
  fn unmask_round_trips() {
    let key = [0x12, 0x34, 0x56, 0x78];
    let mut data = b"masked payload".to_vec();
    unmask(&mut data, key);
    assert_ne!(&data, b"masked payload");
    unmask(&mut data, key);
    assert_eq!(&data, b"masked payload");
  }

  #[tokio::test]
  async fn client_frames_round_trip_through_a_server_reader() {
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (_r, cw) = tokio::io::split(client_side);
    let (sr, _w) = tokio::io::split(server_side);

    let mut writer = WsWriteHalf::new(Box::new(cw), Role::Client);
    let mut reader =
      WsReadHalf::new(Box::new(sr), Role::Server, Vec::new());

    writer.write_binary(b"hello").await.unwrap();
    match reader.read_event().await.unwrap() {
      WsEvent::Data(data) => assert_eq!(data, b"hello"),
      _ => panic!("expected data event"),
    }

    writer.write_close().await.unwrap();
    assert!(matches!(reader.read_event().await.unwrap(), WsEvent::Close));
  }

  #[tokio::test]
  async fn pending_handshake_bytes_are_served_before_the_stream() {
    let (client_side, server_side) = tokio::io::duplex(4096);
    let (_r, cw) = tokio::io::split(client_side);
    let (sr, _w) = tokio::io::split(server_side);

    // Capture an encoded frame's bytes through a scratch duplex.
    let (scratch_a, scratch_b) = tokio::io::duplex(4096);
    let (_ar, aw) = tokio::io::split(scratch_a);
    let (mut br, _bw) = tokio::io::split(scratch_b);
    let mut w = WsWriteHalf::new(Box::new(aw), Role::Server);
    w.write_binary(b"early").await.unwrap();
    // 2-byte header plus the 5-byte unmasked payload.
    let mut captured = vec![0u8; 7];
    br.read_exact(&mut captured).await.unwrap();

    let mut writer = WsWriteHalf::new(Box::new(cw), Role::Server);
    let mut reader = WsReadHalf::new(Box::new(sr), Role::Client, captured);

    writer.write_binary(b"late").await.unwrap();
    match reader.read_event().await.unwrap() {
      WsEvent::Data(data) => assert_eq!(data, b"early"),
      _ => panic!("expected pending data first"),
    }
    match reader.read_event().await.unwrap() {
      WsEvent::Data(data) => assert_eq!(data, b"late"),
      _ => panic!("expected streamed data second"),
    }
  }
}
