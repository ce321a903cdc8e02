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

//! The message dispatcher: terminal chain stage, router tables, and the
//! worker pool.
//!
//! With the pool enabled every request lands on the queue belonging to its
//! connection's assigned worker, which preserves per-connection ordering.
//! With the pool disabled requests run on ephemeral tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::config::Config;
use crate::interceptor::Chain;
use crate::interceptor::ChainBuilder;
use crate::interceptor::Interceptor;
use crate::request::Request;
use crate::request::Route;
use crate::router::Router;
use crate::router::RouterGroup;
use crate::router::RouterSlices;
use crate::router::SliceHandler;

pub struct Dispatcher {
  apis: RwLock<HashMap<u32, Arc<dyn Router>>>,
  slices: Arc<RouterSlices>,
  slices_mode: bool,
  chain: RwLock<ChainBuilder>,
  terminal: OnceLock<Arc<dyn Interceptor>>,
  queues: OnceLock<Vec<mpsc::Sender<Request>>>,
  free_ids: Mutex<Vec<u32>>,
  pool_size: u32,
  queue_len: usize,
  bind_mode: bool,
  /// Backing for the `Arc<Self>` that worker tasks and the terminal chain
  /// stage need.
  self_ref: Weak<Dispatcher>,
}

impl Dispatcher {
  pub(crate) fn new(config: &Config) -> Arc<Self> {
    let bind_mode = config.bind_mode() && config.worker_pool_size > 0;
    // Bind mode gives every admitted connection its own worker, so the
    // pool must be as wide as the admission ceiling.
    let pool_size = if bind_mode {
      config.max_conn as u32
    } else {
      config.worker_pool_size
    };
    let free_ids = if bind_mode {
      (0..pool_size).rev().collect()
    } else {
      Vec::new()
    };
    Arc::new_cyclic(|self_ref| Self {
      apis: RwLock::new(HashMap::new()),
      slices: RouterSlices::new(),
      slices_mode: config.router_slices_mode,
      chain: RwLock::new(ChainBuilder::new()),
      terminal: OnceLock::new(),
      queues: OnceLock::new(),
      free_ids: Mutex::new(free_ids),
      pool_size,
      queue_len: config.max_worker_task_len,
      bind_mode,
      self_ref: self_ref.clone(),
    })
  }

  pub fn slices_mode(&self) -> bool {
    self.slices_mode
  }

  fn pool_enabled(&self) -> bool {
    self.pool_size > 0
  }

  /// Registers a classic router for `msg_id`. Registration is one-shot;
  /// using the classic API in slice mode, or re-registering an id, is a
  /// programmer error and panics.
  pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) {
    if self.slices_mode {
      panic!("classic router API used while RouterSlicesMode is enabled");
    }
    let mut apis = self.apis.write();
    if apis.contains_key(&msg_id) {
      panic!("repeated router registration for msg id {msg_id}");
    }
    apis.insert(msg_id, router);
    debug!(msg_id, "router registered");
  }

  pub fn add_router_slices(
    &self,
    msg_id: u32,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    if !self.slices_mode {
      panic!("slice router API used while RouterSlicesMode is disabled");
    }
    self.slices.add_handlers(msg_id, handlers);
  }

  pub fn use_middleware(
    &self,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    if !self.slices_mode {
      panic!("slice router API used while RouterSlicesMode is disabled");
    }
    self.slices.use_middleware(handlers);
  }

  pub fn group(&self, start: u32, end: u32) -> RouterGroup {
    if !self.slices_mode {
      panic!("slice router API used while RouterSlicesMode is disabled");
    }
    self.slices.group(start, end)
  }

  pub fn add_interceptor(&self, stage: Arc<dyn Interceptor>) {
    self.chain.write().add(stage);
  }

  pub(crate) fn set_decoder_stage(&self, stage: Arc<dyn Interceptor>) {
    self.chain.write().set_head(stage);
  }

  /// Allocates the worker queues and starts one worker per queue. Calling
  /// it again is a no-op.
  pub fn start_worker_pool(&self) {
    if !self.pool_enabled() {
      return;
    }
    self.queues.get_or_init(|| {
      debug!(
        pool_size = self.pool_size,
        queue_len = self.queue_len,
        "starting worker pool"
      );
      (0..self.pool_size)
        .map(|worker_id| {
          let (tx, mut rx) =
            mpsc::channel::<Request>(self.queue_len.max(1));
          let dispatcher = self.self_ref.clone();
          tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
              let Some(dispatcher) = dispatcher.upgrade() else {
                break;
              };
              dispatcher.handle_request(request).await;
            }
            debug!(worker_id, "worker exited");
          });
          tx
        })
        .collect()
    });
  }

  /// Runs `request` through the interceptor chain; the terminal stage
  /// hands it to the worker pool or an ephemeral task.
  pub(crate) async fn execute(&self, request: Request) {
    let terminal = self
      .terminal
      .get_or_init(|| {
        Arc::new(DispatchTail {
          dispatcher: self.self_ref.clone(),
        })
      })
      .clone();
    let stages = self.chain.read().assemble(Some(terminal));
    let _ = Chain::new(stages, request).proceed().await;
  }

  pub(crate) async fn dispatch(&self, request: Request) {
    if self.pool_enabled() && self.queues.get().is_some() {
      self.send_to_task_queue(request).await;
    } else if let Some(dispatcher) = self.self_ref.upgrade() {
      tokio::spawn(async move {
        dispatcher.handle_request(request).await;
      });
    }
  }

  /// Enqueues `request` on its connection's assigned worker queue. The
  /// send blocks while the queue is full, which is what bounds per-
  /// connection inflight work.
  pub async fn send_to_task_queue(&self, request: Request) {
    let Some(queues) = self.queues.get() else {
      warn!("worker pool not started, dropping request");
      return;
    };
    let worker_id =
      request.connection().worker_id() as usize % queues.len();
    if queues[worker_id].send(request).await.is_err() {
      error!(worker_id, "worker queue closed, dropping request");
    }
  }

  async fn handle_request(&self, mut request: Request) {
    let msg_id = request.msg_id();
    let fut = async {
      if matches!(request.route, Route::Call(_)) {
        request.run_call();
      } else if self.slices_mode {
        match self.slices.handlers_for(msg_id) {
          Some(handlers) => {
            request.bind_slice_handlers(handlers);
            request.next().await;
          }
          None => warn!(msg_id, "no handlers registered, dropping message"),
        }
      } else {
        let router = self.apis.read().get(&msg_id).cloned();
        match router {
          Some(router) => {
            request.bind_router(router);
            request.run_classic().await;
          }
          None => warn!(msg_id, "no router registered, dropping message"),
        }
      }
    };
    if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
      error!(msg_id, "handler panicked");
    }
  }

  /// Assigns a worker id for a starting connection: the hashed share in
  /// hash mode, a pooled exclusive id in bind mode, worker 0 when the
  /// pool is disabled. `None` means bind mode ran out of ids, which the
  /// server's admission reservation (at most `MaxConn` connections
  /// between accept and teardown) rules out.
  pub(crate) fn take_worker_id(&self, conn_id: u64) -> Option<u32> {
    if !self.pool_enabled() {
      return Some(0);
    }
    if self.bind_mode {
      self.free_ids.lock().pop()
    } else {
      Some((conn_id % u64::from(self.pool_size)) as u32)
    }
  }

  pub(crate) fn release_worker_id(&self, worker_id: u32) {
    if self.bind_mode {
      self.free_ids.lock().push(worker_id);
    }
  }
}

/// The terminal chain stage.
struct DispatchTail {
  dispatcher: Weak<Dispatcher>,
}

#[async_trait]
impl Interceptor for DispatchTail {
  async fn intercept(&self, chain: Chain) -> Option<Request> {
    let request = chain.into_request();
    if let Some(dispatcher) = self.dispatcher.upgrade() {
      dispatcher.dispatch(request).await;
    }
    None
  }
}
