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

//! Bind-mode exhaustion: with `MaxConn = 2` both live connections own a
//! private worker, a third dial is held off by accept backoff, and the
//! freed worker id is reused after a disconnect.

use std::time::Duration;

use async_trait::async_trait;
use framewire::Client;
use framewire::Config;
use framewire::Request;
use framewire::Router;
use framewire::Server;
use framewire::WORKER_MODE_BIND;
use tokio::sync::mpsc;

const PORT: u16 = 9704;

struct WorkerProbe {
  tx: mpsc::Sender<(u64, u32)>,
}

#[async_trait]
impl Router for WorkerProbe {
  async fn handle(&self, request: &mut Request) {
    let conn = request.connection();
    let _ = self.tx.send((conn.conn_id(), conn.worker_id())).await;
  }
}

async fn wait_for(
  mut cond: impl FnMut() -> bool,
  timeout: Duration,
  what: &str,
) {
  let deadline = tokio::time::Instant::now() + timeout;
  while !cond() {
    assert!(
      tokio::time::Instant::now() < deadline,
      "timed out waiting for {what}"
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_mode_exhausts_and_recycles_worker_ids() {
  let server = Server::new(Config {
    host: "127.0.0.1".to_string(),
    tcp_port: PORT,
    mode: "tcp".to_string(),
    max_conn: 2,
    worker_pool_size: 4,
    worker_mode: WORKER_MODE_BIND.to_string(),
    ..Config::default()
  });
  let (tx, mut rx) = mpsc::channel(4);
  server.add_router(1, WorkerProbe { tx });
  server.start().await.expect("server start");

  let first = Client::new("127.0.0.1", PORT);
  first.start().await;
  first
    .conn()
    .expect("first connected")
    .send_msg(1, b"probe")
    .await
    .expect("send");
  let (_, worker_a) = rx.recv().await.expect("first probe");

  let second = Client::new("127.0.0.1", PORT);
  second.start().await;
  second
    .conn()
    .expect("second connected")
    .send_msg(1, b"probe")
    .await
    .expect("send");
  let (_, worker_b) = rx.recv().await.expect("second probe");

  // Both live connections hold distinct ids from {0, 1}.
  assert_ne!(worker_a, worker_b);
  assert!(worker_a < 2 && worker_b < 2);
  assert_eq!(server.conn_mgr().len(), 2);

  // The third dial reaches the backlog but is not admitted while the
  // free-id set is empty.
  let third = Client::new("127.0.0.1", PORT);
  third.start().await;
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(server.conn_mgr().len(), 2);

  // Freeing one connection admits the third, which reuses the freed id.
  first.stop();
  wait_for(
    || server.conn_mgr().len() == 2 && server.conn_mgr().get(3).is_some(),
    Duration::from_secs(5),
    "third connection admitted",
  )
  .await;

  third
    .conn()
    .expect("third connected")
    .send_msg(1, b"probe")
    .await
    .expect("send");
  let (conn_id, worker_c) = tokio::time::timeout(
    Duration::from_secs(5),
    rx.recv(),
  )
  .await
  .expect("third probe in time")
  .expect("third probe delivered");
  assert_eq!(conn_id, 3);
  assert_eq!(worker_c, worker_a, "freed worker id must be reused");

  second.stop();
  third.stop();
  server.stop();
}
