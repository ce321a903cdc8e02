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

//! Hash-mode fanout: with a pool of 4, connection N's requests must land
//! on worker `N mod 4`.

use std::time::Duration;

use async_trait::async_trait;
use framewire::Client;
use framewire::Config;
use framewire::Request;
use framewire::Router;
use framewire::Server;
use tokio::sync::mpsc;

const PORT: u16 = 9703;

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

#[tokio::test(flavor = "multi_thread")]
async fn hash_mode_routes_by_conn_id_modulo_pool() {
  let server = Server::new(Config {
    host: "127.0.0.1".to_string(),
    tcp_port: PORT,
    mode: "tcp".to_string(),
    max_conn: 100,
    worker_pool_size: 4,
    ..Config::default()
  });
  let (tx, mut rx) = mpsc::channel(8);
  server.add_router(5, WorkerProbe { tx });
  server.start().await.expect("server start");

  // Sequential dials so conn ids are assigned 1..=8.
  let mut clients = Vec::new();
  for _ in 0..8 {
    let client = Client::new("127.0.0.1", PORT);
    client.start().await;
    let conn = client.conn().expect("client connected");
    conn.send_msg(5, b"probe").await.expect("send");
    clients.push(client);
  }

  let mut seen = Vec::new();
  for _ in 0..8 {
    let probe = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("probe in time")
      .expect("probe delivered");
    seen.push(probe);
  }

  seen.sort_by_key(|(conn_id, _)| *conn_id);
  for (conn_id, worker_id) in seen {
    assert!((1..=8).contains(&conn_id));
    assert_eq!(
      u64::from(worker_id),
      conn_id % 4,
      "conn {conn_id} landed on worker {worker_id}"
    );
  }

  for client in &clients {
    client.stop();
  }
  server.stop();
}
