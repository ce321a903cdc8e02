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

//! Routing tables for both handler styles.
//!
//! Classic mode maps a message id to one [`Router`] with a three-step
//! pipeline. Slice mode maps a message id to an ordered handler sequence,
//! with a global middleware prefix and range-checked groups. Registration
//! is one-shot per id in both styles; re-registration is a programmer
//! error and panics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;

use crate::request::Request;

/// A classic three-step message handler. All steps default to no-ops, so
/// implementors override only what they need.
#[async_trait]
pub trait Router: Send + Sync {
  async fn pre_handle(&self, _request: &mut Request) {}
  async fn handle(&self, _request: &mut Request) {}
  async fn post_handle(&self, _request: &mut Request) {}
}

/// One slice-mode handler. Handlers run in registration order; a handler
/// may call [`Request::next`] to run the rest of the sequence inline, or
/// [`Request::abort`] to skip it.
pub type SliceHandler =
  Arc<dyn for<'a> Fn(&'a mut Request) -> BoxFuture<'a, ()> + Send + Sync>;

/// Wraps an async closure as a [`SliceHandler`].
pub fn handler_fn<F>(f: F) -> SliceHandler
where
  F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, ()>
    + Send
    + Sync
    + 'static,
{
  Arc::new(f)
}

/// The slice-mode router table.
pub struct RouterSlices {
  apis: RwLock<HashMap<u32, Vec<SliceHandler>>>,
  middleware: RwLock<Vec<SliceHandler>>,
}

impl RouterSlices {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      apis: RwLock::new(HashMap::new()),
      middleware: RwLock::new(Vec::new()),
    })
  }

  /// Appends middleware applied before every per-id handler registered
  /// after this call.
  pub fn use_middleware(&self, handlers: impl IntoIterator<Item = SliceHandler>) {
    self.middleware.write().extend(handlers);
  }

  /// Registers the handler sequence for `msg_id`, prefixed with the global
  /// middleware. Panics if the id is already registered.
  pub fn add_handlers(
    &self,
    msg_id: u32,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    let mut apis = self.apis.write();
    if apis.contains_key(&msg_id) {
      panic!("repeated handler registration for msg id {msg_id}");
    }
    let mut merged: Vec<SliceHandler> = self.middleware.read().clone();
    merged.extend(handlers);
    apis.insert(msg_id, merged);
  }

  /// Opens a named group asserting `start <= msg_id <= end` on every
  /// registration made through it.
  pub fn group(self: &Arc<Self>, start: u32, end: u32) -> RouterGroup {
    RouterGroup {
      start,
      end,
      handlers: Mutex::new(Vec::new()),
      parent: self.clone(),
    }
  }

  /// The handler sequence for `msg_id`, cloned out under the read lock so
  /// dispatch never blocks registration.
  pub fn handlers_for(&self, msg_id: u32) -> Option<Vec<SliceHandler>> {
    self.apis.read().get(&msg_id).cloned()
  }
}

/// A slice-mode group scoped to a message-id range, with its own
/// middleware prefix.
pub struct RouterGroup {
  start: u32,
  end: u32,
  handlers: Mutex<Vec<SliceHandler>>,
  parent: Arc<RouterSlices>,
}

impl RouterGroup {
  pub fn use_middleware(&self, handlers: impl IntoIterator<Item = SliceHandler>) {
    self.handlers.lock().extend(handlers);
  }

  /// Registers through the parent table. Panics when `msg_id` falls
  /// outside the group range.
  pub fn add_handlers(
    &self,
    msg_id: u32,
    handlers: impl IntoIterator<Item = SliceHandler>,
  ) {
    if msg_id < self.start || msg_id > self.end {
      panic!(
        "msg id {msg_id} outside group range {}..={}",
        self.start, self.end
      );
    }
    let mut merged = self.handlers.lock().clone();
    merged.extend(handlers);
    self.parent.add_handlers(msg_id, merged);
  }
}

/// Middleware that contains panics from downstream handlers so one bad
/// request cannot take the worker down with it.
pub fn recovery_middleware() -> SliceHandler {
  handler_fn(|request: &mut Request| {
    Box::pin(async move {
      let msg_id = request.msg_id();
      let fut = std::panic::AssertUnwindSafe(request.next());
      if fut.catch_unwind().await.is_err() {
        error!(msg_id, "handler panicked");
      }
    })
  })
}

/// Middleware that logs the time spent in the rest of the sequence.
pub fn timing_middleware() -> SliceHandler {
  handler_fn(|request: &mut Request| {
    Box::pin(async move {
      let msg_id = request.msg_id();
      let started = Instant::now();
      request.next().await;
      debug!(msg_id, elapsed = ?started.elapsed(), "handlers done");
    })
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn nop() -> SliceHandler {
    handler_fn(|_req: &mut Request| Box::pin(async {}))
  }

  #[test]
  fn middleware_prefixes_later_registrations() {
    let table = RouterSlices::new();
    table.use_middleware([nop(), nop()]);
    table.add_handlers(10, [nop()]);
    assert_eq!(table.handlers_for(10).unwrap().len(), 3);
    assert!(table.handlers_for(11).is_none());
  }

  #[test]
  #[should_panic(expected = "repeated handler registration")]
  fn duplicate_registration_panics() {
    let table = RouterSlices::new();
    table.add_handlers(5, [nop()]);
    table.add_handlers(5, [nop()]);
  }

  #[test]
  #[should_panic(expected = "outside group range")]
  fn group_rejects_out_of_range_ids() {
    let table = RouterSlices::new();
    let group = table.group(100, 200);
    group.add_handlers(99, [nop()]);
  }

  #[test]
  fn group_merges_its_own_middleware() {
    let table = RouterSlices::new();
    let group = table.group(100, 200);
    group.use_middleware([nop()]);
    group.add_handlers(150, [nop()]);
    assert_eq!(table.handlers_for(150).unwrap().len(), 2);
  }
}
