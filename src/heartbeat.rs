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

//! Per-connection liveness probing.
//!
//! The server holds a template checker; every accepted connection gets a
//! clone with a fresh timer and quit handle, bound to itself. Each tick
//! either declares the remote dead (and runs the not-alive callback,
//! which stops the connection by default) or sends a heartbeat frame the
//! remote is expected to echo, refreshing activity on both ends.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::request::Request;
use crate::router::handler_fn;
use crate::router::Router;
use crate::router::SliceHandler;

/// The message id heartbeat frames travel on unless rebound.
pub const DEFAULT_HEARTBEAT_MSG_ID: u32 = 99999;

pub type MakeMsgFn = Arc<dyn Fn(&Arc<Connection>) -> Vec<u8> + Send + Sync>;
pub type OnNotAliveFn = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type BeatFn = Arc<
  dyn Fn(Arc<Connection>) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// Overrides for [`Heartbeat`] construction.
#[derive(Default)]
pub struct HeartbeatOption {
  pub make_msg: Option<MakeMsgFn>,
  pub on_remote_not_alive: Option<OnNotAliveFn>,
  pub beat: Option<BeatFn>,
  /// Rebinds the heartbeat message id and its handler. Ignored when left
  /// at zero.
  pub msg_id: u32,
  pub router: Option<Arc<dyn Router>>,
}

pub struct Heartbeat {
  interval: Duration,
  msg_id: u32,
  make_msg: MakeMsgFn,
  on_not_alive: OnNotAliveFn,
  beat: Option<BeatFn>,
  router: Arc<dyn Router>,
  conn: OnceLock<Weak<Connection>>,
  cancel: CancellationToken,
}

impl Heartbeat {
  pub fn new(interval: Duration) -> Arc<Self> {
    Arc::new(Self {
      interval,
      msg_id: DEFAULT_HEARTBEAT_MSG_ID,
      make_msg: Arc::new(default_make_msg),
      on_not_alive: Arc::new(default_not_alive),
      beat: None,
      router: Arc::new(HeartbeatEchoRouter),
      conn: OnceLock::new(),
      cancel: CancellationToken::new(),
    })
  }

  pub fn with_option(interval: Duration, option: HeartbeatOption) -> Arc<Self> {
    let mut msg_id = DEFAULT_HEARTBEAT_MSG_ID;
    let mut router: Arc<dyn Router> = Arc::new(HeartbeatEchoRouter);
    if option.msg_id != 0 && option.msg_id != DEFAULT_HEARTBEAT_MSG_ID {
      msg_id = option.msg_id;
      if let Some(custom) = option.router {
        router = custom;
      }
    }
    Arc::new(Self {
      interval,
      msg_id,
      make_msg: option.make_msg.unwrap_or_else(|| Arc::new(default_make_msg)),
      on_not_alive: option
        .on_remote_not_alive
        .unwrap_or_else(|| Arc::new(default_not_alive)),
      beat: option.beat,
      router,
      conn: OnceLock::new(),
      cancel: CancellationToken::new(),
    })
  }

  pub fn msg_id(&self) -> u32 {
    self.msg_id
  }

  pub fn router(&self) -> Arc<dyn Router> {
    self.router.clone()
  }

  /// The slice-mode route equivalent of [`Heartbeat::router`].
  pub fn slice_handler(&self) -> SliceHandler {
    let router = self.router.clone();
    handler_fn(move |request: &mut Request| {
      let router = router.clone();
      Box::pin(async move {
        router.handle(request).await;
      })
    })
  }

  /// Deep-clones the template onto a connection: same callbacks, fresh
  /// timer and quit handle, bound to `conn`.
  pub(crate) fn clone_to(&self, conn: &Arc<Connection>) -> Arc<Heartbeat> {
    let cloned = Arc::new(Self {
      interval: self.interval,
      msg_id: self.msg_id,
      make_msg: self.make_msg.clone(),
      on_not_alive: self.on_not_alive.clone(),
      beat: self.beat.clone(),
      router: self.router.clone(),
      conn: OnceLock::new(),
      cancel: CancellationToken::new(),
    });
    let _ = cloned.conn.set(Arc::downgrade(conn));
    cloned
  }

  pub(crate) fn start(self: Arc<Self>) {
    let hb = self;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(hb.interval);
      // The zeroth tick completes immediately.
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = hb.cancel.cancelled() => break,
          _ = ticker.tick() => hb.check().await,
        }
      }
      debug!("heartbeat checker stopped");
    });
  }

  pub(crate) fn stop(&self) {
    self.cancel.cancel();
  }

  async fn check(&self) {
    let Some(conn) = self.conn.get().and_then(Weak::upgrade) else {
      return;
    };
    if !conn.is_alive() {
      warn!(
        conn_id = conn.conn_id(),
        remote = conn.remote_addr(),
        "remote not alive"
      );
      (self.on_not_alive)(&conn);
      return;
    }
    let sent = match &self.beat {
      Some(beat) => beat(conn.clone()).await,
      None => {
        let payload = (self.make_msg)(&conn);
        conn.send_msg(self.msg_id, &payload).await
      }
    };
    if let Err(err) = sent {
      warn!(conn_id = conn.conn_id(), ?err, "heartbeat send failed");
    }
  }
}

fn default_make_msg(conn: &Arc<Connection>) -> Vec<u8> {
  format!(
    "heartbeat [{} -> {}]",
    conn.local_addr(),
    conn.remote_addr()
  )
  .into_bytes()
}

fn default_not_alive(conn: &Arc<Connection>) {
  conn.stop();
}

/// The default route for inbound heartbeat frames. Receiving the frame is
/// what refreshes activity; the handler only records it.
struct HeartbeatEchoRouter;

#[async_trait]
impl Router for HeartbeatEchoRouter {
  async fn handle(&self, request: &mut Request) {
    debug!(
      remote = request.connection().remote_addr(),
      msg_id = request.msg_id(),
      "heartbeat received"
    );
  }
}
