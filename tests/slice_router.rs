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

//! Slice-mode dispatch: global middleware runs before per-id handlers in
//! registration order, and `abort` skips the rest of the sequence.

use std::sync::Arc;
use std::time::Duration;

use framewire::handler_fn;
use framewire::Client;
use framewire::Config;
use framewire::Request;
use framewire::Server;
use framewire::SliceHandler;
use parking_lot::Mutex;
use tokio::sync::mpsc;

const PORT: u16 = 9709;

fn tag(
  log: &Arc<Mutex<Vec<&'static str>>>,
  label: &'static str,
) -> SliceHandler {
  let log = log.clone();
  handler_fn(move |_request: &mut Request| {
    let log = log.clone();
    Box::pin(async move {
      log.lock().push(label);
    })
  })
}

#[tokio::test(flavor = "multi_thread")]
async fn middleware_then_handlers_then_abort() {
  let server = Server::new(Config {
    host: "127.0.0.1".to_string(),
    tcp_port: PORT,
    mode: "tcp".to_string(),
    router_slices_mode: true,
    ..Config::default()
  });

  let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
  let (tx, mut rx) = mpsc::channel(2);

  let done = {
    let tx = tx.clone();
    let log = log.clone();
    handler_fn(move |_request: &mut Request| {
      let tx = tx.clone();
      let log = log.clone();
      Box::pin(async move {
        let snapshot = log.lock().clone();
        let _ = tx.send(snapshot).await;
      })
    })
  };

  server.use_middleware([tag(&log, "mw")]);
  server.add_router_slices(
    10,
    [tag(&log, "first"), tag(&log, "second"), done.clone()],
  );

  // The aborting sequence never reaches its tail; completion is signalled
  // by the aborting handler itself.
  let aborting = {
    let tx = tx.clone();
    let log = log.clone();
    handler_fn(move |request: &mut Request| {
      let tx = tx.clone();
      let log = log.clone();
      request.abort();
      Box::pin(async move {
        log.lock().push("aborted");
        let snapshot = log.lock().clone();
        let _ = tx.send(snapshot).await;
      })
    })
  };
  let group = server.group(20, 29);
  group.add_handlers(20, [aborting, tag(&log, "unreachable")]);

  server.start().await.expect("server start");

  let client = Client::with_config(
    "127.0.0.1",
    PORT,
    Config {
      router_slices_mode: true,
      ..Config::default()
    },
  );
  client.start().await;
  let conn = client.conn().expect("client connected");

  conn.send_msg(10, b"run").await.expect("send");
  let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("sequence in time")
    .expect("sequence delivered");
  assert_eq!(first, vec!["mw", "first", "second"]);

  conn.send_msg(20, b"run").await.expect("send");
  let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("abort sequence in time")
    .expect("abort sequence delivered");
  assert_eq!(second, vec!["mw", "first", "second", "mw", "aborted"]);

  client.stop();
  server.stop();
}
