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

use tracing::info;
use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::shardmap::ShardMap;

/// The live-connection registry, keyed by the decimal string form of the
/// connection id and backed by the sharded map for O(1) lookup under
/// churn.
pub struct ConnManager {
  connections: ShardMap<Arc<Connection>>,
}

impl Default for ConnManager {
  fn default() -> Self {
    Self::new()
  }
}

impl ConnManager {
  pub fn new() -> Self {
    Self {
      connections: ShardMap::new(),
    }
  }

  pub(crate) fn add(&self, conn: &Arc<Connection>) {
    self.connections.insert(conn.conn_id_str(), conn.clone());
    info!(total = self.len(), "connection registered");
  }

  pub(crate) fn remove(&self, conn: &Connection) {
    self.connections.remove(conn.conn_id_str());
    info!(
      conn_id = conn.conn_id(),
      total = self.len(),
      "connection removed"
    );
  }

  pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
    self.connections.get(&conn_id.to_string())
  }

  pub fn get_by_str(&self, conn_id: &str) -> Option<Arc<Connection>> {
    self.connections.get(conn_id)
  }

  pub fn len(&self) -> usize {
    self.connections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }

  pub fn all_conn_ids(&self) -> Vec<u64> {
    self
      .connections
      .keys()
      .into_iter()
      .filter_map(|k| k.parse().ok())
      .collect()
  }

  pub fn all_conn_id_strs(&self) -> Vec<String> {
    self.connections.keys()
  }

  /// Stops every connection and empties the registry. Each removal runs
  /// under its shard's write lock; the stop itself only signals the
  /// connection's cancellation, so finalizers run on their own tasks.
  pub fn clear(&self) {
    for key in self.connections.keys() {
      self.connections.remove_if(&key, |_, conn| match conn {
        Some(conn) => {
          conn.stop();
          true
        }
        None => false,
      });
    }
    info!("all connections cleared");
  }

  /// Visits every live connection. A callback error is logged and
  /// iteration continues; there is no short-circuit.
  pub fn range<F>(&self, mut f: F)
  where
    F: FnMut(u64, &Arc<Connection>) -> Result<()>,
  {
    self.connections.for_each(|key, conn| {
      let conn_id = key.parse().unwrap_or_default();
      if let Err(err) = f(conn_id, conn) {
        warn!(conn_id, ?err, "range callback failed");
      }
    });
  }
}
