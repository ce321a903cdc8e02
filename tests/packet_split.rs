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

//! Two frames written in a single TCP segment must surface as two
//! requests, in order, with the exact payloads.

use std::time::Duration;

use async_trait::async_trait;
use framewire::Config;
use framewire::Message;
use framewire::Packet;
use framewire::Request;
use framewire::Router;
use framewire::Server;
use framewire::TlvPacket;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const PORT: u16 = 9702;

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
async fn coalesced_frames_dispatch_in_order() {
  let server = Server::new(Config {
    host: "127.0.0.1".to_string(),
    tcp_port: PORT,
    mode: "tcp".to_string(),
    ..Config::default()
  });
  let (tx, mut rx) = mpsc::channel(2);
  server.add_router(1, Collector { tx: tx.clone() });
  server.add_router(2, Collector { tx });
  server.start().await.expect("server start");

  let packer = TlvPacket::new(0);
  let first = packer.pack(&Message::new(1, &b"wireTest"[..])).unwrap();
  let second = packer
    .pack(&Message::new(
      2,
      "\u{4f60}\u{597d}!!!".as_bytes().to_vec(),
    ))
    .unwrap();
  let mut joined = first.to_vec();
  joined.extend_from_slice(&second);

  let mut stream = TcpStream::connect(("127.0.0.1", PORT))
    .await
    .expect("dial");
  stream.write_all(&joined).await.expect("single write");

  let (id_a, payload_a) =
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("first frame in time")
      .expect("first frame delivered");
  let (id_b, payload_b) =
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("second frame in time")
      .expect("second frame delivered");

  assert_eq!(id_a, 1);
  assert_eq!(payload_a, b"wireTest");
  assert_eq!(id_b, 2);
  assert_eq!(payload_b, "\u{4f60}\u{597d}!!!".as_bytes());

  server.stop();
}
