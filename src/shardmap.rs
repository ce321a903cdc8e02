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

//! A string-keyed concurrent map split into 32 lock-guarded shards to keep
//! contention off the hot add/remove/lookup path of the connection
//! registry. Shard selection uses a 32-bit FNV hash, which spreads the
//! near-identical decimal connection ids well.

use std::collections::HashMap;

use parking_lot::RwLock;

pub const SHARD_COUNT: usize = 32;

const FNV_PRIME: u32 = 16777619;
const FNV_SEED: u32 = 2166136261;

fn fnv32(key: &str) -> u32 {
  let mut hash = FNV_SEED;
  for b in key.as_bytes() {
    hash = hash.wrapping_mul(FNV_PRIME);
    hash ^= u32::from(*b);
  }
  hash
}

pub struct ShardMap<V> {
  shards: Vec<RwLock<HashMap<String, V>>>,
}

impl<V: Clone> Default for ShardMap<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V: Clone> ShardMap<V> {
  pub fn new() -> Self {
    Self {
      shards: (0..SHARD_COUNT)
        .map(|_| RwLock::new(HashMap::new()))
        .collect(),
    }
  }

  fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
    &self.shards[fnv32(key) as usize % SHARD_COUNT]
  }

  pub fn insert(&self, key: impl Into<String>, value: V) {
    let key = key.into();
    self.shard(&key).write().insert(key, value);
  }

  /// Inserts only when the key is absent. Returns whether the insert
  /// happened.
  pub fn insert_if_absent(&self, key: impl Into<String>, value: V) -> bool {
    let key = key.into();
    let mut shard = self.shard(&key).write();
    if shard.contains_key(&key) {
      false
    } else {
      shard.insert(key, value);
      true
    }
  }

  pub fn get(&self, key: &str) -> Option<V> {
    self.shard(key).read().get(key).cloned()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.shard(key).read().contains_key(key)
  }

  pub fn remove(&self, key: &str) {
    self.shard(key).write().remove(key);
  }

  /// Removes and returns the value.
  pub fn pop(&self, key: &str) -> Option<V> {
    self.shard(key).write().remove(key)
  }

  /// Calls `decide` with the current value while holding the shard write
  /// lock; removes the entry when `decide` returns true and it exists.
  /// Returns what `decide` returned.
  pub fn remove_if<F>(&self, key: &str, decide: F) -> bool
  where
    F: FnOnce(&str, Option<&V>) -> bool,
  {
    let mut shard = self.shard(key).write();
    let remove = decide(key, shard.get(key));
    if remove {
      shard.remove(key);
    }
    remove
  }

  pub fn len(&self) -> usize {
    self.shards.iter().map(|s| s.read().len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) {
    for shard in &self.shards {
      shard.write().clear();
    }
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys = Vec::with_capacity(self.len());
    for shard in &self.shards {
      keys.extend(shard.read().keys().cloned());
    }
    keys
  }

  pub fn items(&self) -> Vec<(String, V)> {
    let mut items = Vec::with_capacity(self.len());
    for shard in &self.shards {
      items.extend(
        shard.read().iter().map(|(k, v)| (k.clone(), v.clone())),
      );
    }
    items
  }

  /// Visits every entry, one read-locked shard at a time. The callback
  /// observes a consistent view of each shard but not across shards.
  pub fn for_each<F>(&self, mut f: F)
  where
    F: FnMut(&str, &V),
  {
    for shard in &self.shards {
      let shard = shard.read();
      for (key, value) in shard.iter() {
        f(key, value);
      }
    }
  }
}
