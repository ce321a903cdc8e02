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

//! The TLV contract is transport-agnostic: the same ping/pong flow over
//! WebSocket binary frames, including the upgrade handshake and client
//! masking.

use std::time::Duration;

use async_trait::async_trait;
use framewire::Client;
use framewire::Config;
use framewire::Request;
use framewire::Router;
use framewire::Server;
use tokio::sync::mpsc;

const PORT: u16 = 9708;

struct PingRouter;

#[async_trait]
impl Router for PingRouter {
  async fn handle(&self, request: &mut Request) {
    assert_eq!(request.data(), b"hello");
    let _ = request
      .connection()
      .send_msg(100, b"ping...ping...ping")
      .await;
  }
}

struct Collector {
  tx: mpsc::Sender<(u32, Vec<u8>)>,
}

#[async_trait]
impl Router for Collector {
  async fn handle(&self, request: &mut Request) {
    let _ = self
      .tx
      .send((request.msg_id(), request.data().to_vec()))
      .await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_pong_over_websocket() {
  let mut server = Server::new(Config {
    host: "127.0.0.1".to_string(),
    ws_port: PORT,
    mode: "websocket".to_string(),
    ..Config::default()
  });
  server.set_ws_auth(|request| request.path == "/");
  server.add_router(100, PingRouter);
  server.start().await.expect("server start");

  let (tx, mut rx) = mpsc::channel(1);
  let client = Client::new_ws("127.0.0.1", PORT);
  client.add_router(100, Collector { tx });
  client.start().await;
  let conn = client.conn().expect("client connected");

  conn.send_msg(100, b"hello").await.expect("send");

  let (msg_id, payload) =
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("reply in time")
      .expect("reply delivered");
  assert_eq!(msg_id, 100);
  assert_eq!(payload, b"ping...ping...ping");

  client.stop();
  server.stop();
}
