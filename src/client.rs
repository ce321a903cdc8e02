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

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::config::Config;
use crate::connection::ConnHook;
use crate::connection::ConnOptions;
use crate::connection::Connection;
use crate::connection::TransportReader;
use crate::connection::TransportWriter;
use crate::decoder::Decoder;
use crate::decoder::LengthField;
use crate::decoder::TlvDecoder;
use crate::dispatch::Dispatcher;
use crate::error::FramewireError;
use crate::error::Result;
use crate::heartbeat::Heartbeat;
use crate::heartbeat::HeartbeatOption;
use crate::interceptor::Interceptor;
use crate::packet::packet_factory;
use crate::packet::Packet;
use crate::packet::PacketStyle;
use crate::router::Router;
use crate::router::SliceHandler;
use crate::tls;
use crate::ws;

#[derive(Clone, Copy, PartialEq, Eq)]
enum DialMode {
  Tcp,
  Tls,
  Websocket,
}

/// The dialing peer: one outbound connection with the same handler,
/// packet, decoder, and heartbeat surface as the server. The worker pool
/// is disabled for clients, so dispatch runs inline on ephemeral tasks.
pub struct Client {
  name: String,
  ip: String,
  port: u16,
  mode: DialMode,
  config: Arc<Config>,
  dispatcher: Arc<Dispatcher>,
  packet: Arc<dyn Packet>,
  length_field: Option<LengthField>,
  decoder_stage: Option<Arc<dyn Interceptor>>,
  on_start: Option<ConnHook>,
  on_stop: Option<ConnHook>,
  heartbeat: Option<Arc<Heartbeat>>,
  conn: Mutex<Option<Arc<Connection>>>,
  exit: Mutex<CancellationToken>,
  err_tx: mpsc::Sender<FramewireError>,
  err_rx: Mutex<Option<mpsc::Receiver<FramewireError>>>,
}

impl Client {
  pub fn new(ip: impl Into<String>, port: u16) -> Client {
    Self::build(ip.into(), port, DialMode::Tcp, Config::default())
  }

  pub fn new_ws(ip: impl Into<String>, port: u16) -> Client {
    Self::build(ip.into(), port, DialMode::Websocket, Config::default())
  }

  /// Dials TCP wrapped in TLS. The peer certificate is not verified,
  /// which is what self-signed server deployments need.
  pub fn new_tls(ip: impl Into<String>, port: u16) -> Client {
    Self::build(ip.into(), port, DialMode::Tls, Config::default())
  }

  pub fn with_config(
    ip: impl Into<String>,
    port: u16,
    config: Config,
  ) -> Client {
    Self::build(ip.into(), port, DialMode::Tcp, config)
  }

  fn build(ip: String, port: u16, mode: DialMode, config: Config) -> Client {
    let config = Arc::new(Config {
      // Clients dispatch inline.
      worker_pool_size: 0,
      ..config
    });
    let dispatcher = Dispatcher::new(&config);
    let packet = packet_factory(PacketStyle::Tlv, config.max_packet_size);
    let decoder = TlvDecoder::tlv(config.max_packet_size);
    let length_field = decoder.length_field();
    let (err_tx, err_rx) = mpsc::channel(16);
    Client {
      name: match mode {
        DialMode::Websocket => "FramewireClientWs".to_string(),
        _ => "FramewireClientTcp".to_string(),
      },
      ip,
      port,
      mode,
      config,
      dispatcher,
      packet,
      length_field,
      decoder_stage: Some(Arc::new(decoder)),
      on_start: None,
      on_stop: None,
      heartbeat: None,
      conn: Mutex::new(None),
      exit: Mutex::new(CancellationToken::new()),
      err_tx,
      err_rx: Mutex::new(Some(err_rx)),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn set_name(&mut self, name: impl Into<String>) {
    self.name = name.into();
  }

  /// The established connection, once dialing succeeded.
  pub fn conn(&self) -> Option<Arc<Connection>> {
    self.conn.lock().clone()
  }

  /// Takes the receiver on which dial errors are delivered.
  pub fn take_error_receiver(
    &self,
  ) -> Option<mpsc::Receiver<FramewireError>> {
    self.err_rx.lock().take()
  }

  pub fn add_router(&self, msg_id: u32, router: impl Router + 'static) {
    self.dispatcher.add_router(msg_id, Arc::new(router));
  }

  pub fn add_router_slices(
    &self,
    msg_id: u32,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    self.dispatcher.add_router_slices(msg_id, handlers);
  }

  pub fn add_interceptor(&self, stage: Arc<dyn Interceptor>) {
    self.dispatcher.add_interceptor(stage);
  }

  pub fn set_packet(&mut self, packet: Arc<dyn Packet>) {
    self.packet = packet;
  }

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

  /// Installs the decoder stage and dials. Dial errors are logged and
  /// delivered on the error channel.
  pub async fn start(&self) {
    if let Some(stage) = &self.decoder_stage {
      self.dispatcher.set_decoder_stage(stage.clone());
    }
    self.restart().await;
  }

  /// Resets the exit handle and dials again. The previous connection, if
  /// any, must have been stopped already.
  pub async fn restart(&self) {
    {
      let mut exit = self.exit.lock();
      *exit = CancellationToken::new();
    }
    match self.dial().await {
      Ok(conn) => {
        if let Some(heartbeat) = &self.heartbeat {
          conn.set_heartbeat(heartbeat.clone_to(&conn));
        }
        *self.conn.lock() = Some(conn.clone());
        info!(
          local = conn.local_addr(),
          remote = conn.remote_addr(),
          "client connected"
        );
        tokio::spawn(conn.start());
      }
      Err(err) => {
        error!(?err, "client dial failed");
        let _ = self.err_tx.try_send(err);
      }
    }
  }

  /// Stops the connection and fires the client's exit handle.
  pub fn stop(&self) {
    info!(name = %self.name, "client stopping");
    if let Some(conn) = self.conn.lock().clone() {
      conn.stop();
    }
    self.exit.lock().cancel();
  }

  async fn dial(&self) -> Result<Arc<Connection>> {
    let addr = format!("{}:{}", self.ip, self.port);
    let stream = TcpStream::connect(&addr).await?;
    let _ = stream.set_nodelay(true);
    let local = stream
      .local_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_default();
    let remote = stream
      .peer_addr()
      .map(|addr| addr.to_string())
      .unwrap_or_else(|_| addr.clone());

    let (reader, writer) = match self.mode {
      DialMode::Tcp => {
        let (r, w) = stream.into_split();
        (
          TransportReader::Stream(Box::new(r)),
          TransportWriter::Stream(Box::new(w)),
        )
      }
      DialMode::Tls => {
        let connector = TlsConnector::from(tls::client_config());
        let server_name =
          ServerName::try_from(self.ip.clone()).map_err(|_| {
            FramewireError::Handshake(format!(
              "invalid server name {}",
              self.ip
            ))
          })?;
        let stream = connector.connect(server_name, stream).await?;
        let (r, w) = tokio::io::split(stream);
        (
          TransportReader::Stream(Box::new(r)),
          TransportWriter::Stream(Box::new(w)),
        )
      }
      DialMode::Websocket => {
        let (r, w) = ws::client_handshake(stream, &addr).await?;
        (TransportReader::Ws(r), TransportWriter::Ws(w))
      }
    };

    Ok(Connection::new(
      0,
      local,
      remote,
      reader,
      writer,
      ConnOptions {
        name: self.name.clone(),
        config: self.config.clone(),
        dispatcher: self.dispatcher.clone(),
        packet: self.packet.clone(),
        length_field: self.length_field.clone(),
        on_start: self.on_start.clone(),
        on_stop: self.on_stop.clone(),
        registry: None,
        cancel: self.exit.lock().child_token(),
      },
    ))
  }
}
