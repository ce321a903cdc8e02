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

//! Lifecycle contracts: hooks run once and in order, and every send after
//! `stop` fails with a closed error.

use std::sync::Arc;
use std::time::Duration;

use framewire::Client;
use framewire::Config;
use framewire::FramewireError;
use framewire::Server;
use parking_lot::Mutex;

const PORT: u16 = 9707;

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
async fn hooks_run_once_and_sends_fail_after_stop() {
  let server = Server::new(Config {
    host: "127.0.0.1".to_string(),
    tcp_port: PORT,
    mode: "tcp".to_string(),
    ..Config::default()
  });
  server.start().await.expect("server start");

  let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
  let mut client = Client::new("127.0.0.1", PORT);
  let on_start = events.clone();
  client.set_on_conn_start(move |_conn| {
    let on_start = on_start.clone();
    async move {
      on_start.lock().push("start");
    }
  });
  let on_stop = events.clone();
  client.set_on_conn_stop(move |_conn| {
    let on_stop = on_stop.clone();
    async move {
      on_stop.lock().push("stop");
    }
  });

  client.start().await;
  let conn = client.conn().expect("client connected");

  // A buffered send first, so the writer task exists and is torn down
  // with the rest.
  conn.send_buff_msg(9, b"buffered").await.expect("buffered send");
  conn.send_msg(9, b"direct").await.expect("direct send");

  conn.stop();
  wait_for(|| conn.is_closed(), Duration::from_secs(5), "finalizer").await;

  assert!(matches!(
    conn.send_msg(9, b"late").await,
    Err(FramewireError::ConnectionClosed)
  ));
  assert!(matches!(
    conn.send_buff_msg(9, b"late").await,
    Err(FramewireError::ConnectionClosed)
  ));
  assert!(matches!(
    conn.send(b"raw").await,
    Err(FramewireError::ConnectionClosed)
  ));

  // Stopping again must not re-run the finalizer.
  conn.stop();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(*events.lock(), vec!["start", "stop"]);

  client.stop();
  server.stop();
}
