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

use futures::future::BoxFuture;

use crate::connection::Connection;
use crate::interceptor::IcData;
use crate::message::Message;
use crate::router::Router;
use crate::router::SliceHandler;

/// Position within the classic three-step handler pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandleStep {
  PreHandle,
  Handle,
  PostHandle,
  HandleOver,
}

impl HandleStep {
  fn following(self) -> HandleStep {
    match self {
      HandleStep::PreHandle => HandleStep::Handle,
      HandleStep::Handle => HandleStep::PostHandle,
      HandleStep::PostHandle | HandleStep::HandleOver => {
        HandleStep::HandleOver
      }
    }
  }
}

/// How a request is routed once it reaches a worker. Two router styles
/// coexist, so the route is a sum: a classic three-step router, an ordered
/// handler slice, or a bare call scheduled onto the connection's worker
/// (used by the async-op completion path).
pub(crate) enum Route {
  Classic {
    router: Option<Arc<dyn Router>>,
    step: HandleStep,
    need_next: bool,
  },
  Slice {
    handlers: Vec<SliceHandler>,
    index: isize,
  },
  Call(Option<Box<dyn FnOnce() + Send>>),
}

/// One unit of inbound work: the connection it arrived on, the framed
/// message, an optional decode result attached by the chain, and the route
/// state driving handler execution.
pub struct Request {
  conn: Arc<Connection>,
  message: Message,
  response: Option<IcData>,
  pub(crate) route: Route,
}

impl Request {
  pub fn new(conn: Arc<Connection>, message: Message) -> Self {
    Self {
      conn,
      message,
      response: None,
      route: Route::Classic {
        router: None,
        step: HandleStep::PreHandle,
        need_next: true,
      },
    }
  }

  /// A request carrying no message, only a function to run in the
  /// connection's ordering domain.
  pub(crate) fn call(
    conn: Arc<Connection>,
    f: Box<dyn FnOnce() + Send>,
  ) -> Self {
    Self {
      conn,
      message: Message::default(),
      response: None,
      route: Route::Call(Some(f)),
    }
  }

  pub fn connection(&self) -> &Arc<Connection> {
    &self.conn
  }

  pub fn msg_id(&self) -> u32 {
    self.message.id()
  }

  pub fn data(&self) -> &[u8] {
    self.message.data()
  }

  pub fn message(&self) -> &Message {
    &self.message
  }

  pub fn set_message(&mut self, message: Message) {
    self.message = message;
  }

  /// The decode result attached by an interceptor stage, if any.
  pub fn response(&self) -> Option<&IcData> {
    self.response.as_ref()
  }

  pub fn set_response(&mut self, response: IcData) {
    self.response = Some(response);
  }

  pub(crate) fn bind_router(&mut self, router: Arc<dyn Router>) {
    self.route = Route::Classic {
      router: Some(router),
      step: HandleStep::PreHandle,
      need_next: true,
    };
  }

  pub(crate) fn bind_slice_handlers(&mut self, handlers: Vec<SliceHandler>) {
    self.route = Route::Slice {
      handlers,
      index: -1,
    };
  }

  /// Stops handler execution. Pending steps (classic) or remaining slice
  /// handlers are skipped; the handler that called this still runs to
  /// completion.
  pub fn abort(&mut self) {
    match &mut self.route {
      Route::Classic {
        step, need_next, ..
      } => {
        *step = HandleStep::HandleOver;
        *need_next = false;
      }
      Route::Slice { handlers, index } => {
        *index = handlers.len() as isize;
      }
      Route::Call(_) => {}
    }
  }

  /// Jumps to a specific classic step. The caller is responsible for not
  /// creating cycles.
  pub fn goto_step(&mut self, target: HandleStep) {
    if let Route::Classic {
      step, need_next, ..
    } = &mut self.route
    {
      *step = target;
      *need_next = false;
    }
  }

  /// Slice mode only: advances to the next handler in the sequence. A
  /// handler may call this to chain explicitly; handlers that do not are
  /// still advanced by the dispatch loop.
  pub fn next(&mut self) -> BoxFuture<'_, ()> {
    Box::pin(async move {
      loop {
        let handler = match &mut self.route {
          Route::Slice { handlers, index } => {
            *index += 1;
            if *index < 0 || (*index as usize) >= handlers.len() {
              return;
            }
            handlers[*index as usize].clone()
          }
          _ => return,
        };
        handler(&mut *self).await;
      }
    })
  }

  /// Runs the classic `PreHandle -> Handle -> PostHandle` pipeline,
  /// honoring `abort` and `goto_step`.
  pub(crate) async fn run_classic(&mut self) {
    loop {
      let (router, step) = match &self.route {
        Route::Classic {
          router: Some(router),
          step,
          ..
        } => (router.clone(), *step),
        _ => return,
      };
      match step {
        HandleStep::PreHandle => router.pre_handle(self).await,
        HandleStep::Handle => router.handle(self).await,
        HandleStep::PostHandle => router.post_handle(self).await,
        HandleStep::HandleOver => return,
      }
      if let Route::Classic {
        step, need_next, ..
      } = &mut self.route
      {
        if *need_next {
          *step = step.following();
        } else {
          *need_next = true;
        }
      }
    }
  }

  /// Runs a call route. No-op for message routes.
  pub(crate) fn run_call(&mut self) {
    if let Route::Call(f) = &mut self.route {
      if let Some(f) = f.take() {
        f();
      }
    }
  }
}
