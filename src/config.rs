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

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::FramewireError;
use crate::error::Result;

pub const MODE_TCP: &str = "tcp";
pub const MODE_WEBSOCKET: &str = "websocket";
pub const MODE_KCP: &str = "kcp";

pub const WORKER_MODE_HASH: &str = "Hash";
pub const WORKER_MODE_BIND: &str = "Bind";

/// Framework configuration.
///
/// There is no process-global config block: construct one (or
/// [`Config::load`] it from a JSON file) and hand it to the server or
/// client explicitly. The JSON keys keep their historical PascalCase
/// names, so existing config files keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
  pub host: String,
  #[serde(rename = "TCPPort")]
  pub tcp_port: u16,
  pub ws_port: u16,
  pub kcp_port: u16,
  pub name: String,
  pub version: String,

  /// `"tcp"`, `"websocket"`, `"kcp"`, or empty for TCP and WebSocket
  /// concurrently.
  pub mode: String,
  pub max_conn: usize,
  pub max_packet_size: u32,
  pub worker_pool_size: u32,
  pub max_worker_task_len: usize,
  /// `""`/`"Hash"` for deterministic sharing, `"Bind"` for an exclusive
  /// worker per live connection.
  pub worker_mode: String,
  pub max_msg_chan_len: usize,
  #[serde(rename = "IOReadBuffSize")]
  pub io_read_buff_size: usize,

  /// Liveness window in seconds.
  pub heartbeat_max: u64,

  pub cert_file: String,
  pub private_key_file: String,

  /// Selects the slice router style; the classic and slice registration
  /// APIs are mutually exclusive.
  pub router_slices_mode: bool,

  // Logging keys are recognized for config-file compatibility; wiring a
  // subscriber is the embedding application's concern.
  pub log_dir: String,
  pub log_file: String,
  pub log_cons: bool,
  pub log_save_days: u32,
  pub log_file_size: u64,
  pub log_isolation_level: u8,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      host: "0.0.0.0".to_string(),
      tcp_port: 8999,
      ws_port: 9000,
      kcp_port: 9001,
      name: "FramewireServerApp".to_string(),
      version: "V1.0".to_string(),
      mode: MODE_TCP.to_string(),
      max_conn: 12000,
      max_packet_size: 4096,
      worker_pool_size: 10,
      max_worker_task_len: 1024,
      worker_mode: String::new(),
      max_msg_chan_len: 1024,
      io_read_buff_size: 1024,
      heartbeat_max: 10,
      cert_file: String::new(),
      private_key_file: String::new(),
      router_slices_mode: false,
      log_dir: "./log".to_string(),
      log_file: String::new(),
      log_cons: false,
      log_save_days: 0,
      log_file_size: 0,
      log_isolation_level: 0,
    }
  }
}

impl Config {
  /// Loads a JSON config file. Unknown keys are ignored; missing keys fall
  /// back to the defaults above.
  pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
      .map_err(|err| FramewireError::Config(err.to_string()))
  }

  pub fn heartbeat_max(&self) -> Duration {
    Duration::from_secs(self.heartbeat_max)
  }

  pub fn serves_tcp(&self) -> bool {
    self.mode.is_empty() || self.mode == MODE_TCP
  }

  pub fn serves_websocket(&self) -> bool {
    self.mode.is_empty() || self.mode == MODE_WEBSOCKET
  }

  pub(crate) fn tls_enabled(&self) -> bool {
    !self.cert_file.is_empty() && !self.private_key_file.is_empty()
  }

  pub(crate) fn bind_mode(&self) -> bool {
    self.worker_mode == WORKER_MODE_BIND
  }
}
