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

//! Keyed async workers for handler-issued blocking work.
//!
//! A handler that needs slow side work (a database write, say) hands it to
//! [`AsyncOps::process`] keyed by an operation id; every operation with
//! the same key runs on the same single worker, in order. The matching
//! [`AsyncOpResult`] carries the outcome back: its completion callback is
//! re-enqueued on the owning connection's worker queue, so continuation
//! code resumes in the connection's ordering domain instead of on the
//! async worker.

use std::any::Any;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::error;

use crate::connection::Connection;
use crate::request::Request;

const ASYNC_WORKER_COUNT: usize = 2048;
const ASYNC_QUEUE_LEN: usize = 2048;

type Job = Box<dyn FnOnce() + Send>;

/// A fixed array of lazily started single-task workers. Worker slots are
/// created on first use; `OnceLock` gives the double-checked init the
/// slot needs.
pub struct AsyncOps {
  workers: Vec<OnceLock<mpsc::Sender<Job>>>,
}

impl AsyncOps {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      workers: (0..ASYNC_WORKER_COUNT).map(|_| OnceLock::new()).collect(),
    })
  }

  /// Enqueues `op` on worker `op_id mod N`. Blocks while that worker's
  /// queue is full.
  pub async fn process(&self, op_id: i64, op: impl FnOnce() + Send + 'static) {
    let index = op_id.unsigned_abs() as usize % ASYNC_WORKER_COUNT;
    let tx = self.workers[index]
      .get_or_init(|| {
        let (tx, mut rx) = mpsc::channel::<Job>(ASYNC_QUEUE_LEN);
        tokio::spawn(async move {
          while let Some(job) = rx.recv().await {
            let job = std::panic::AssertUnwindSafe(job);
            if std::panic::catch_unwind(job).is_err() {
              error!("async operation panicked");
            }
          }
        });
        tx
      })
      .clone();
    if tx.send(Box::new(op)).await.is_err() {
      error!(op_id, "async worker queue closed");
    }
  }
}

struct ResultState {
  returned: Option<Arc<dyn Any + Send + Sync>>,
  has_returned: bool,
  complete: Option<Box<dyn FnOnce() + Send>>,
  has_complete: bool,
  fired: bool,
}

/// The rendezvous between an async operation and its continuation. Both
/// the returned value and the completion callback are set-once; whichever
/// lands last fires the callback, exactly once, on the owning
/// connection's worker queue.
pub struct AsyncOpResult {
  conn: Arc<Connection>,
  state: Mutex<ResultState>,
}

impl AsyncOpResult {
  pub fn new(conn: Arc<Connection>) -> Arc<Self> {
    Arc::new(Self {
      conn,
      state: Mutex::new(ResultState {
        returned: None,
        has_returned: false,
        complete: None,
        has_complete: false,
        fired: false,
      }),
    })
  }

  pub fn returned(&self) -> Option<Arc<dyn Any + Send + Sync>> {
    self.state.lock().returned.clone()
  }

  /// Records the operation's result. Later calls are ignored.
  pub fn set_returned(&self, value: Arc<dyn Any + Send + Sync>) {
    let mut state = self.state.lock();
    if state.has_returned {
      return;
    }
    state.has_returned = true;
    state.returned = Some(value);
    self.maybe_fire(&mut state);
  }

  /// Registers the completion callback. Later calls are ignored. Fires
  /// immediately when the result already landed.
  pub fn on_complete(&self, complete: impl FnOnce() + Send + 'static) {
    let mut state = self.state.lock();
    if state.has_complete {
      return;
    }
    state.has_complete = true;
    state.complete = Some(Box::new(complete));
    if state.has_returned {
      self.maybe_fire(&mut state);
    }
  }

  fn maybe_fire(&self, state: &mut ResultState) {
    if state.fired {
      return;
    }
    let Some(complete) = state.complete.take() else {
      return;
    };
    state.fired = true;
    let conn = self.conn.clone();
    let dispatcher = conn.dispatcher().clone();
    let request = Request::call(conn, complete);
    tokio::spawn(async move {
      dispatcher.dispatch(request).await;
    });
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  use super::*;
  use crate::connection::testing;

  async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
      assert!(tokio::time::Instant::now() < deadline, "timed out");
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  }

  #[tokio::test]
  async fn completion_fires_exactly_once() {
    let result = AsyncOpResult::new(testing::connection());
    let fired = Arc::new(AtomicUsize::new(0));

    result.set_returned(Arc::new(42u32));
    let counter = fired.clone();
    result.on_complete(move || {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    // Both sides are set-once; the late arrivals are ignored.
    result.set_returned(Arc::new(43u32));
    result.on_complete(|| panic!("second callback must be dropped"));

    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let returned = result.returned().expect("value recorded");
    assert_eq!(returned.downcast_ref::<u32>(), Some(&42));
  }

  #[tokio::test]
  async fn same_key_operations_run_in_order() {
    let ops = AsyncOps::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10u32 {
      let log = log.clone();
      ops
        .process(5, move || {
          log.lock().push(i);
        })
        .await;
    }
    wait_until(|| log.lock().len() == 10).await;
    assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
  }
}
