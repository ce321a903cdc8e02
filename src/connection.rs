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

//! One accepted (or dialed) stream.
//!
//! A connection owns a reader task and, after the first buffered send, a
//! writer task. `Stop` cancels the per-connection token; the task blocked
//! in [`Connection::start`] then runs the finalizer exactly once. The
//! send lock guards the closed flag and the buffered channel handle:
//! senders hold it for reads, the finalizer takes it for writing.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::config::Config;
use crate::connmgr::ConnManager;
use crate::decoder::FrameDecoder;
use crate::decoder::LengthField;
use crate::dispatch::Dispatcher;
use crate::error::FramewireError;
use crate::error::Result;
use crate::heartbeat::Heartbeat;
use crate::message::Message;
use crate::packet::Packet;
use crate::request::Request;
use crate::ws::WsEvent;
use crate::ws::WsReadHalf;
use crate::ws::WsWriteHalf;

/// How long a buffered send waits for queue space.
const SEND_QUEUE_TIMEOUT: std::time::Duration =
  std::time::Duration::from_millis(5);

/// A connection lifecycle hook.
pub type ConnHook =
  Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`ConnHook`].
pub fn conn_hook<F, Fut>(f: F) -> ConnHook
where
  F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = ()> + Send + 'static,
{
  Arc::new(move |conn| Box::pin(f(conn)))
}

/// The read side of the underlying stream. TCP and TLS deliver raw bytes
/// for the frame decoder; WebSocket delivers whole data messages.
pub(crate) enum TransportReader {
  Stream(Box<dyn AsyncRead + Send + Unpin>),
  Ws(WsReadHalf),
}

pub(crate) enum TransportWriter {
  Stream(Box<dyn AsyncWrite + Send + Unpin>),
  Ws(WsWriteHalf),
}

impl TransportWriter {
  async fn write_payload(&mut self, data: &[u8]) -> Result<()> {
    match self {
      TransportWriter::Stream(stream) => {
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
      }
      TransportWriter::Ws(ws) => ws.write_binary(data).await,
    }
  }

  async fn shutdown(&mut self) -> Result<()> {
    match self {
      TransportWriter::Stream(stream) => {
        stream.shutdown().await?;
        Ok(())
      }
      TransportWriter::Ws(ws) => ws.shutdown().await,
    }
  }
}

struct SendState {
  closed: bool,
  buf_tx: Option<mpsc::Sender<Bytes>>,
}

/// Everything a connection inherits from the server or client that built
/// it. Hooks are captured function values: the connection keeps no back
/// reference to its builder.
pub(crate) struct ConnOptions {
  pub name: String,
  pub config: Arc<Config>,
  pub dispatcher: Arc<Dispatcher>,
  pub packet: Arc<dyn Packet>,
  pub length_field: Option<LengthField>,
  pub on_start: Option<ConnHook>,
  pub on_stop: Option<ConnHook>,
  pub registry: Option<Arc<ConnManager>>,
  pub cancel: CancellationToken,
}

pub struct Connection {
  conn_id: u64,
  conn_id_str: String,
  name: String,
  local_addr: String,
  remote_addr: String,
  config: Arc<Config>,
  dispatcher: Arc<Dispatcher>,
  packet: Arc<dyn Packet>,
  length_field: Option<LengthField>,
  on_start: Option<ConnHook>,
  on_stop: Option<ConnHook>,
  registry: Option<Arc<ConnManager>>,
  reader: Mutex<Option<TransportReader>>,
  writer: tokio::sync::Mutex<TransportWriter>,
  send_state: RwLock<SendState>,
  property: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
  last_activity: Mutex<Instant>,
  heartbeat: Mutex<Option<Arc<Heartbeat>>>,
  worker_id: AtomicU32,
  /// Set only once a worker id was actually taken; the finalizer must not
  /// return an id this connection never owned.
  has_worker: AtomicBool,
  cancel: CancellationToken,
  /// Backing for the `Arc<Self>` that spawned tasks and requests need.
  self_ref: Weak<Connection>,
}

impl Connection {
  pub(crate) fn new(
    conn_id: u64,
    local_addr: String,
    remote_addr: String,
    reader: TransportReader,
    writer: TransportWriter,
    opts: ConnOptions,
  ) -> Arc<Self> {
    Arc::new_cyclic(|self_ref| Self {
      conn_id,
      conn_id_str: conn_id.to_string(),
      name: opts.name,
      local_addr,
      remote_addr,
      config: opts.config,
      dispatcher: opts.dispatcher,
      packet: opts.packet,
      length_field: opts.length_field,
      on_start: opts.on_start,
      on_stop: opts.on_stop,
      registry: opts.registry,
      reader: Mutex::new(Some(reader)),
      writer: tokio::sync::Mutex::new(writer),
      send_state: RwLock::new(SendState {
        closed: false,
        buf_tx: None,
      }),
      property: RwLock::new(HashMap::new()),
      last_activity: Mutex::new(Instant::now()),
      heartbeat: Mutex::new(None),
      worker_id: AtomicU32::new(0),
      has_worker: AtomicBool::new(false),
      cancel: opts.cancel,
      self_ref: self_ref.clone(),
    })
  }

  fn arc(&self) -> Option<Arc<Connection>> {
    self.self_ref.upgrade()
  }

  pub fn conn_id(&self) -> u64 {
    self.conn_id
  }

  pub fn conn_id_str(&self) -> &str {
    &self.conn_id_str
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn local_addr(&self) -> &str {
    &self.local_addr
  }

  pub fn remote_addr(&self) -> &str {
    &self.remote_addr
  }

  pub fn worker_id(&self) -> u32 {
    self.worker_id.load(Ordering::Relaxed)
  }

  pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
    &self.dispatcher
  }

  pub(crate) fn set_heartbeat(&self, heartbeat: Arc<Heartbeat>) {
    *self.heartbeat.lock() = Some(heartbeat);
  }

  /// A token cancelled when the connection shuts down. User tasks tied to
  /// this connection should watch it.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn is_closed(&self) -> bool {
    self.send_state.read().closed
  }

  /// Alive means not closed and heard from within the liveness window.
  pub fn is_alive(&self) -> bool {
    !self.is_closed()
      && self.last_activity.lock().elapsed() < self.config.heartbeat_max()
  }

  pub(crate) fn update_activity(&self) {
    *self.last_activity.lock() = Instant::now();
  }

  /// Drives the connection: runs the on-start hook, starts the heartbeat,
  /// takes a worker id, spawns the reader, then parks until cancellation
  /// and finalizes. The server and client spawn this onto its own task.
  pub async fn start(self: Arc<Self>) {
    if let Some(hook) = &self.on_start {
      hook(self.clone()).await;
    }

    let heartbeat = self.heartbeat.lock().clone();
    if let Some(heartbeat) = heartbeat {
      self.update_activity();
      heartbeat.start();
    }

    match self.dispatcher.take_worker_id(self.conn_id) {
      Some(worker_id) => {
        self.worker_id.store(worker_id, Ordering::Relaxed);
        self.has_worker.store(true, Ordering::Relaxed);
      }
      None => {
        // The admission reservation keeps this unreachable.
        error!(conn_id = self.conn_id, "no free worker id");
        self.cancel.cancel();
      }
    }

    tokio::spawn(self.clone().reader_loop());

    self.cancel.cancelled().await;
    self.finalize().await;
  }

  /// Signals shutdown. Safe to call any number of times, from anywhere.
  pub fn stop(&self) {
    self.cancel.cancel();
  }

  async fn reader_loop(self: Arc<Self>) {
    debug!(conn_id = self.conn_id, "reader task running");
    let reader = self.reader.lock().take();
    let Some(mut reader) = reader else { return };
    let mut decoder = self.length_field.clone().map(FrameDecoder::new);
    let mut buf = vec![0u8; self.config.io_read_buff_size.max(1)];

    loop {
      let input = tokio::select! {
        _ = self.cancel.cancelled() => break,
        input = read_input(&mut reader, &mut buf) => input,
      };
      match input {
        Ok(Input::Bytes(n)) => {
          self.update_activity();
          if !self.deliver(&buf[..n], &mut decoder).await {
            break;
          }
        }
        Ok(Input::WsData(data)) => {
          self.update_activity();
          if !self.deliver(&data, &mut decoder).await {
            break;
          }
        }
        Ok(Input::WsPing(payload)) => {
          // Control traffic refreshes activity but is never dispatched.
          self.update_activity();
          if let TransportWriter::Ws(ws) = &mut *self.writer.lock().await {
            let _ = ws.write_pong(&payload).await;
          }
        }
        Ok(Input::WsPong) => self.update_activity(),
        Ok(Input::Closed) => {
          debug!(conn_id = self.conn_id, "remote closed");
          break;
        }
        Err(err) => {
          debug!(conn_id = self.conn_id, ?err, "read failed");
          break;
        }
      }
    }

    self.stop();
    debug!(conn_id = self.conn_id, "reader task exit");
  }

  /// Frames `data` and hands each frame to the interceptor chain. Returns
  /// false when the decoder hit a fatal error and the reader must exit.
  async fn deliver(
    &self,
    data: &[u8],
    decoder: &mut Option<FrameDecoder>,
  ) -> bool {
    let Some(conn) = self.arc() else { return false };
    match decoder {
      Some(decoder) => {
        let frames = match decoder.decode(data) {
          Ok(frames) => frames,
          Err(err) => {
            error!(conn_id = self.conn_id, ?err, "frame decode failed");
            return false;
          }
        };
        for frame in frames {
          let request = Request::new(conn.clone(), Message::raw(frame));
          self.dispatcher.execute(request).await;
        }
      }
      None => {
        let request =
          Request::new(conn, Message::raw(Bytes::copy_from_slice(data)));
        self.dispatcher.execute(request).await;
      }
    }
    true
  }

  async fn writer_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
    debug!(conn_id = self.conn_id, "writer task running");
    loop {
      tokio::select! {
        _ = self.cancel.cancelled() => break,
        item = rx.recv() => match item {
          Some(data) => {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_payload(&data).await {
              error!(conn_id = self.conn_id, ?err, "buffered write failed");
              drop(writer);
              self.stop();
              break;
            }
          }
          None => break,
        },
      }
    }
    debug!(conn_id = self.conn_id, "writer task exit");
  }

  /// Write-through send of pre-packed bytes.
  pub async fn send(&self, data: &[u8]) -> Result<()> {
    if self.is_closed() {
      return Err(FramewireError::ConnectionClosed);
    }
    let mut writer = self.writer.lock().await;
    writer.write_payload(data).await
  }

  /// Buffered send of pre-packed bytes. The writer task is started on the
  /// first call; enqueueing waits at most 5 ms.
  pub async fn send_to_queue(&self, data: impl Into<Bytes>) -> Result<()> {
    let tx = {
      let state = self.send_state.read();
      if state.closed {
        return Err(FramewireError::ConnectionClosed);
      }
      state.buf_tx.clone()
    };
    let tx = match tx {
      Some(tx) => tx,
      None => self.ensure_writer()?,
    };
    match tx.send_timeout(data.into(), SEND_QUEUE_TIMEOUT).await {
      Ok(()) => Ok(()),
      Err(SendTimeoutError::Timeout(_)) => Err(FramewireError::SendTimeout),
      Err(SendTimeoutError::Closed(_)) => {
        Err(FramewireError::ConnectionClosed)
      }
    }
  }

  /// Packs and sends a message directly.
  pub async fn send_msg(&self, msg_id: u32, data: &[u8]) -> Result<()> {
    let wire = self
      .packet
      .pack(&Message::new(msg_id, Bytes::copy_from_slice(data)))?;
    self.send(&wire).await
  }

  /// Packs and enqueues a message for the writer task.
  pub async fn send_buff_msg(&self, msg_id: u32, data: &[u8]) -> Result<()> {
    let wire = self
      .packet
      .pack(&Message::new(msg_id, Bytes::copy_from_slice(data)))?;
    self.send_to_queue(wire).await
  }

  fn ensure_writer(&self) -> Result<mpsc::Sender<Bytes>> {
    let Some(conn) = self.arc() else {
      return Err(FramewireError::ConnectionClosed);
    };
    let mut state = self.send_state.write();
    if state.closed {
      return Err(FramewireError::ConnectionClosed);
    }
    if let Some(tx) = &state.buf_tx {
      return Ok(tx.clone());
    }
    let (tx, rx) = mpsc::channel(self.config.max_msg_chan_len.max(1));
    state.buf_tx = Some(tx.clone());
    tokio::spawn(conn.writer_loop(rx));
    Ok(tx)
  }

  pub fn set_property(
    &self,
    key: impl Into<String>,
    value: Arc<dyn Any + Send + Sync>,
  ) {
    self.property.write().insert(key.into(), value);
  }

  pub fn get_property(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
    self.property.read().get(key).cloned()
  }

  pub fn remove_property(&self, key: &str) {
    self.property.write().remove(key);
  }

  /// The one-shot teardown. Runs in the task parked in
  /// [`Connection::start`]; the closed flag under the send write lock
  /// makes re-entry a no-op.
  async fn finalize(&self) {
    let buf_tx = {
      let mut state = self.send_state.write();
      if state.closed {
        return;
      }
      state.closed = true;
      state.buf_tx.take()
    };

    if let Some(hook) = &self.on_stop {
      if let Some(conn) = self.arc() {
        hook(conn).await;
      }
    }

    let heartbeat = self.heartbeat.lock().take();
    if let Some(heartbeat) = heartbeat {
      heartbeat.stop();
    }

    {
      let mut writer = self.writer.lock().await;
      let _ = writer.shutdown().await;
    }

    if let Some(registry) = &self.registry {
      registry.remove(self);
    }

    // Closing the channel ends the writer task; undelivered buffered
    // messages are dropped.
    drop(buf_tx);

    if self.has_worker.swap(false, Ordering::Relaxed) {
      self
        .dispatcher
        .release_worker_id(self.worker_id.load(Ordering::Relaxed));
    }

    info!(
      conn_id = self.conn_id,
      remote = %self.remote_addr,
      "connection stopped"
    );
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use crate::packet::packet_factory;
  use crate::packet::PacketStyle;

  /// A connection over an in-memory duplex, for exercising the request
  /// pipeline without sockets. The read side is never started.
  pub(crate) fn connection() -> Arc<Connection> {
    let (local, _peer) = tokio::io::duplex(1024);
    let (r, w) = tokio::io::split(local);
    let config = Arc::new(Config {
      worker_pool_size: 0,
      ..Config::default()
    });
    Connection::new(
      1,
      "local".to_string(),
      "remote".to_string(),
      TransportReader::Stream(Box::new(r)),
      TransportWriter::Stream(Box::new(w)),
      ConnOptions {
        name: "test".to_string(),
        config: config.clone(),
        dispatcher: Dispatcher::new(&config),
        packet: packet_factory(PacketStyle::Tlv, 0),
        length_field: None,
        on_start: None,
        on_stop: None,
        registry: None,
        cancel: CancellationToken::new(),
      },
    )
  }
}

enum Input {
  Bytes(usize),
  WsData(Vec<u8>),
  WsPing(Vec<u8>),
  WsPong,
  Closed,
}

async fn read_input(
  reader: &mut TransportReader,
  buf: &mut [u8],
) -> Result<Input> {
  match reader {
    TransportReader::Stream(stream) => {
      let n = stream.read(buf).await?;
      if n == 0 {
        Ok(Input::Closed)
      } else {
        Ok(Input::Bytes(n))
      }
    }
    TransportReader::Ws(ws) => match ws.read_event().await? {
      WsEvent::Data(data) => Ok(Input::WsData(data)),
      WsEvent::Ping(payload) => Ok(Input::WsPing(payload)),
      WsEvent::Pong => Ok(Input::WsPong),
      WsEvent::Close => Ok(Input::Closed),
    },
  }
}
