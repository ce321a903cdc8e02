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

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::config::MODE_KCP;
use crate::connection::ConnHook;
use crate::connection::ConnOptions;
use crate::connection::Connection;
use crate::connection::TransportReader;
use crate::connection::TransportWriter;
use crate::connmgr::ConnManager;
use crate::decoder::Decoder;
use crate::decoder::LengthField;
use crate::decoder::TlvDecoder;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::heartbeat::Heartbeat;
use crate::heartbeat::HeartbeatOption;
use crate::interceptor::Interceptor;
use crate::packet::packet_factory;
use crate::packet::Packet;
use crate::packet::PacketStyle;
use crate::router::Router;
use crate::router::RouterGroup;
use crate::router::SliceHandler;
use crate::tls;
use crate::ws;
use crate::ws::UpgradeRequest;

/// The WebSocket upgrade authentication hook. Returning false answers the
/// request with 403 and drops the stream.
pub type WsAuthFn = Arc<dyn Fn(&UpgradeRequest) -> bool + Send + Sync>;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
enum TransportKind {
  Tcp,
  Websocket,
}

/// The accepting endpoint: listens on the configured transports, admits up
/// to `MaxConn` connections, and drives each through its lifecycle.
pub struct Server {
  config: Arc<Config>,
  dispatcher: Arc<Dispatcher>,
  conn_mgr: Arc<ConnManager>,
  packet: Arc<dyn Packet>,
  length_field: Option<LengthField>,
  decoder_stage: Option<Arc<dyn Interceptor>>,
  on_start: Option<ConnHook>,
  on_stop: Option<ConnHook>,
  heartbeat: Option<Arc<Heartbeat>>,
  ws_auth: Option<WsAuthFn>,
  conn_counter: Arc<AtomicU64>,
  /// Connections admitted and not yet torn down, across all listeners.
  /// Counted from before the accept so a burst of dials cannot slip past
  /// `MaxConn` while earlier ones are still setting up.
  admitted: Arc<AtomicUsize>,
  cancel: CancellationToken,
}

impl Server {
  pub fn new(config: Config) -> Server {
    let config = Arc::new(config);
    let dispatcher = Dispatcher::new(&config);
    let packet =
      packet_factory(PacketStyle::Tlv, config.max_packet_size);
    let decoder = TlvDecoder::tlv(config.max_packet_size);
    let length_field = decoder.length_field();
    Server {
      config,
      dispatcher,
      conn_mgr: Arc::new(ConnManager::new()),
      packet,
      length_field,
      decoder_stage: Some(Arc::new(decoder)),
      on_start: None,
      on_stop: None,
      heartbeat: None,
      ws_auth: None,
      conn_counter: Arc::new(AtomicU64::new(1)),
      admitted: Arc::new(AtomicUsize::new(0)),
      cancel: CancellationToken::new(),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn conn_mgr(&self) -> &Arc<ConnManager> {
    &self.conn_mgr
  }

  /// Classic-mode registration. Panics in slice mode or on a duplicate id.
  pub fn add_router(&self, msg_id: u32, router: impl Router + 'static) {
    self.dispatcher.add_router(msg_id, Arc::new(router));
  }

  /// Slice-mode registration. Panics in classic mode or on a duplicate id.
  pub fn add_router_slices(
    &self,
    msg_id: u32,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    self.dispatcher.add_router_slices(msg_id, handlers);
  }

  pub fn use_middleware(
    &self,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    self.dispatcher.use_middleware(handlers);
  }

  pub fn group(&self, start: u32, end: u32) -> RouterGroup {
    self.dispatcher.group(start, end)
  }

  pub fn add_interceptor(&self, stage: Arc<dyn Interceptor>) {
    self.dispatcher.add_interceptor(stage);
  }

  pub fn set_packet(&mut self, packet: Arc<dyn Packet>) {
    self.packet = packet;
  }

  /// Replaces the frame decoder injected as the chain's first stage.
  pub fn set_decoder(&mut self, decoder: impl Decoder + 'static) {
    self.length_field = decoder.length_field();
    self.decoder_stage = Some(Arc::new(decoder));
  }

  pub fn set_on_conn_start<F, Fut>(&mut self, hook: F)
  where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    self.on_start = Some(crate::connection::conn_hook(hook));
  }

  pub fn set_on_conn_stop<F, Fut>(&mut self, hook: F)
  where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
  {
    self.on_stop = Some(crate::connection::conn_hook(hook));
  }

  pub fn set_ws_auth<F>(&mut self, auth: F)
  where
    F: Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
  {
    self.ws_auth = Some(Arc::new(auth));
  }

  /// Installs the template heartbeat checker and registers its route so
  /// the remote's echo refreshes activity.
  pub fn start_heartbeat(&mut self, interval: Duration) {
    let heartbeat = Heartbeat::new(interval);
    self.register_heartbeat_route(&heartbeat);
    self.heartbeat = Some(heartbeat);
  }

  pub fn start_heartbeat_with_option(
    &mut self,
    interval: Duration,
    option: HeartbeatOption,
  ) {
    let heartbeat = Heartbeat::with_option(interval, option);
    self.register_heartbeat_route(&heartbeat);
    self.heartbeat = Some(heartbeat);
  }

  fn register_heartbeat_route(&self, heartbeat: &Arc<Heartbeat>) {
    if self.dispatcher.slices_mode() {
      self
        .dispatcher
        .add_router_slices(heartbeat.msg_id(), [heartbeat.slice_handler()]);
    } else {
      self
        .dispatcher
        .add_router(heartbeat.msg_id(), heartbeat.router());
    }
  }

  /// Binds the configured listeners and spawns their accept loops. Bind
  /// failures surface here; everything after runs in the background.
  pub async fn start(&self) -> Result<()> {
    info!(
      name = %self.config.name,
      version = %self.config.version,
      "server starting"
    );

    if let Some(stage) = &self.decoder_stage {
      self.dispatcher.set_decoder_stage(stage.clone());
    }
    self.dispatcher.start_worker_pool();

    let tls = if self.config.tls_enabled() {
      let config = tls::server_config(
        Path::new(&self.config.cert_file),
        Path::new(&self.config.private_key_file),
      )?;
      Some(TlsAcceptor::from(config))
    } else {
      None
    };

    if self.config.serves_tcp() {
      let addr = format!("{}:{}", self.config.host, self.config.tcp_port);
      let listener = TcpListener::bind(&addr).await?;
      info!(%addr, tls = tls.is_some(), "tcp listener started");
      tokio::spawn(accept_loop(
        self.accept_context(tls.clone()),
        listener,
        TransportKind::Tcp,
      ));
    }

    if self.config.serves_websocket() {
      let addr = format!("{}:{}", self.config.host, self.config.ws_port);
      let listener = TcpListener::bind(&addr).await?;
      info!(%addr, "websocket listener started");
      tokio::spawn(accept_loop(
        self.accept_context(None),
        listener,
        TransportKind::Websocket,
      ));
    }

    if self.config.mode == MODE_KCP {
      warn!("kcp transport is a placeholder, nothing was started");
    }

    Ok(())
  }

  /// Starts and blocks until ctrl-c or [`Server::stop`].
  pub async fn serve(&self) -> Result<()> {
    self.start().await?;
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("interrupt received, shutting down");
        self.stop();
      }
      _ = self.cancel.cancelled() => {}
    }
    Ok(())
  }

  /// Closes the listeners and stops every registered connection.
  pub fn stop(&self) {
    info!(name = %self.config.name, "server stopping");
    self.cancel.cancel();
    self.conn_mgr.clear();
  }

  fn accept_context(&self, tls: Option<TlsAcceptor>) -> Arc<AcceptContext> {
    Arc::new(AcceptContext {
      config: self.config.clone(),
      dispatcher: self.dispatcher.clone(),
      conn_mgr: self.conn_mgr.clone(),
      packet: self.packet.clone(),
      length_field: self.length_field.clone(),
      on_start: self.on_start.clone(),
      on_stop: self.on_stop.clone(),
      heartbeat: self.heartbeat.clone(),
      ws_auth: self.ws_auth.clone(),
      conn_counter: self.conn_counter.clone(),
      admitted: self.admitted.clone(),
      cancel: self.cancel.clone(),
      tls,
    })
  }
}

/// Everything an accept loop needs, detached from the `Server` value so
/// the loops only borrow captured state.
struct AcceptContext {
  config: Arc<Config>,
  dispatcher: Arc<Dispatcher>,
  conn_mgr: Arc<ConnManager>,
  packet: Arc<dyn Packet>,
  length_field: Option<LengthField>,
  on_start: Option<ConnHook>,
  on_stop: Option<ConnHook>,
  heartbeat: Option<Arc<Heartbeat>>,
  ws_auth: Option<WsAuthFn>,
  conn_counter: Arc<AtomicU64>,
  admitted: Arc<AtomicUsize>,
  cancel: CancellationToken,
  tls: Option<TlsAcceptor>,
}

impl AcceptContext {
  /// Reserves one admission slot; fails once `MaxConn` are held.
  fn reserve_slot(&self) -> bool {
    self
      .admitted
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        (n < self.config.max_conn).then_some(n + 1)
      })
      .is_ok()
  }

  fn release_slot(&self) {
    self.admitted.fetch_sub(1, Ordering::SeqCst);
  }
}

async fn accept_loop(
  ctx: Arc<AcceptContext>,
  listener: TcpListener,
  kind: TransportKind,
) {
  let mut delay = ACCEPT_BACKOFF_BASE;
  'accept: loop {
    if ctx.cancel.is_cancelled() {
      break;
    }

    // At the ceiling the listener backs off instead of accepting, so
    // excess dials queue in the backlog. This check is advisory; the
    // binding reservation happens after the accept.
    if ctx.admitted.load(Ordering::SeqCst) >= ctx.config.max_conn {
      warn!(
        max_conn = ctx.config.max_conn,
        "connection limit reached, delaying accept"
      );
      if sleep_or_cancelled(&ctx.cancel, delay).await {
        break;
      }
      delay = (delay * 2).min(ACCEPT_BACKOFF_CAP);
      continue;
    }

    let accepted = tokio::select! {
      _ = ctx.cancel.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    match accepted {
      Ok((stream, peer)) => {
        delay = ACCEPT_BACKOFF_BASE;
        // The slot is taken atomically and held until the connection
        // tears down, so concurrent accepts on the other transport's
        // listener cannot push past `MaxConn`. Losing the race keeps
        // the socket waiting here until a slot frees.
        while !ctx.reserve_slot() {
          warn!(
            max_conn = ctx.config.max_conn,
            "connection limit reached, delaying admission"
          );
          if sleep_or_cancelled(&ctx.cancel, delay).await {
            break 'accept;
          }
          delay = (delay * 2).min(ACCEPT_BACKOFF_CAP);
        }
        delay = ACCEPT_BACKOFF_BASE;
        let conn_id = ctx.conn_counter.fetch_add(1, Ordering::SeqCst);
        let ctx = ctx.clone();
        tokio::spawn(async move {
          run_accepted(ctx, stream, peer.to_string(), conn_id, kind).await;
        });
      }
      Err(err) => {
        error!(?err, "accept failed");
        if sleep_or_cancelled(&ctx.cancel, delay).await {
          break;
        }
        delay = (delay * 2).min(ACCEPT_BACKOFF_CAP);
      }
    }
  }
  info!("listener closed");
}

/// Sleeps for `delay`, returning true when cancellation fired instead.
async fn sleep_or_cancelled(
  cancel: &CancellationToken,
  delay: Duration,
) -> bool {
  tokio::select! {
    _ = cancel.cancelled() => true,
    _ = tokio::time::sleep(delay) => false,
  }
}

/// Drives one admitted connection and returns its admission slot when it
/// ends, whether setup failed or the connection ran to completion.
async fn run_accepted(
  ctx: Arc<AcceptContext>,
  stream: TcpStream,
  remote: String,
  conn_id: u64,
  kind: TransportKind,
) {
  drive_accepted(&ctx, stream, remote, conn_id, kind).await;
  ctx.release_slot();
}

async fn drive_accepted(
  ctx: &Arc<AcceptContext>,
  stream: TcpStream,
  remote: String,
  conn_id: u64,
  kind: TransportKind,
) {
  let _ = stream.set_nodelay(true);
  let local = stream
    .local_addr()
    .map(|addr| addr.to_string())
    .unwrap_or_default();

  let halves = match kind {
    TransportKind::Tcp => match &ctx.tls {
      Some(acceptor) => match acceptor.accept(stream).await {
        Ok(stream) => {
          let (r, w) = tokio::io::split(stream);
          (
            TransportReader::Stream(Box::new(r)),
            TransportWriter::Stream(Box::new(w)),
          )
        }
        Err(err) => {
          warn!(%remote, ?err, "tls accept failed");
          return;
        }
      },
      None => {
        let (r, w) = stream.into_split();
        (
          TransportReader::Stream(Box::new(r)),
          TransportWriter::Stream(Box::new(w)),
        )
      }
    },
    TransportKind::Websocket => {
      let auth = ctx.ws_auth.as_ref().map(|auth| {
        auth.as_ref()
          as &(dyn Fn(&UpgradeRequest) -> bool + Send + Sync)
      });
      match ws::server_upgrade(stream, auth).await {
        Ok((r, w)) => {
          (TransportReader::Ws(r), TransportWriter::Ws(w))
        }
        Err(err) => {
          warn!(%remote, ?err, "websocket upgrade failed");
          return;
        }
      }
    }
  };

  info!(conn_id, %remote, "connection accepted");
  let conn = Connection::new(
    conn_id,
    local,
    remote,
    halves.0,
    halves.1,
    ConnOptions {
      name: ctx.config.name.clone(),
      config: ctx.config.clone(),
      dispatcher: ctx.dispatcher.clone(),
      packet: ctx.packet.clone(),
      length_field: ctx.length_field.clone(),
      on_start: ctx.on_start.clone(),
      on_stop: ctx.on_stop.clone(),
      registry: Some(ctx.conn_mgr.clone()),
      cancel: ctx.cancel.child_token(),
    },
  );
  if let Some(heartbeat) = &ctx.heartbeat {
    conn.set_heartbeat(heartbeat.clone_to(&conn));
  }
  ctx.conn_mgr.add(&conn);
  conn.start().await;
}
