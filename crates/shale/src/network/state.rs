// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Result of a single-key write, as surfaced by the `network.setState`
/// router tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub old_value: Option<Value>,
    pub new_value: Value,
}

type Watcher = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct StateInner {
    values: RwLock<HashMap<String, Value>>,
    watchers: RwLock<Vec<(u64, Watcher)>>,
    next_watcher_id: AtomicU64,
}

/// Shared mutable state of one network. Single-key reads and writes are
/// atomic; no transactional semantics across keys.
#[derive(Clone)]
pub struct NetworkState {
    inner: Arc<StateInner>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StateInner {
                values: RwLock::new(HashMap::new()),
                watchers: RwLock::new(Vec::new()),
                next_watcher_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let values = self
            .inner
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default_value: Value) -> Value {
        self.get(key).unwrap_or(default_value)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> StateChange {
        let key = key.into();
        let old_value = {
            let mut values = self
                .inner
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            values.insert(key.clone(), value.clone())
        };
        self.notify(&key, &value);
        StateChange {
            old_value,
            new_value: value,
        }
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        let removed = {
            let mut values = self
                .inner
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            values.remove(key)
        };
        if removed.is_some() {
            self.notify(key, &Value::Null);
        }
        removed
    }

    /// Merges a map of keys into the state. Applying the same update
    /// twice leaves the state identical to applying it once.
    pub fn update(&self, entries: &HashMap<String, Value>) {
        {
            let mut values = self
                .inner
                .values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (key, value) in entries {
                values.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in entries {
            self.notify(key, value);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        let values = self
            .inner
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.clone()
    }

    pub fn clear(&self) {
        let mut values = self
            .inner
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.clear();
    }

    pub fn len(&self) -> usize {
        let values = self
            .inner
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn watch<F>(&self, watcher: F) -> u64
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let mut watchers = self
            .inner
            .watchers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers.push((id, Arc::new(watcher)));
        id
    }

    pub fn unwatch(&self, id: u64) {
        let mut watchers = self
            .inner
            .watchers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers.retain(|(watcher_id, _)| *watcher_id != id);
    }

    fn notify(&self, key: &str, value: &Value) {
        let watchers: Vec<Watcher> = {
            let watchers = self
                .inner
                .watchers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            watchers.iter().map(|(_, w)| w.clone()).collect()
        };
        for watcher in watchers {
            watcher(key, value);
        }
    }

    /// Shallow diff against an earlier snapshot: added and changed keys
    /// carry the new value, deleted keys carry `null`.
    pub fn diff_from(&self, before: &HashMap<String, Value>) -> HashMap<String, Value> {
        let after = self.snapshot();
        let mut changes = HashMap::new();
        for (key, value) in &after {
            if before.get(key) != Some(value) {
                changes.insert(key.clone(), value.clone());
            }
        }
        for key in before.keys() {
            if !after.contains_key(key) {
                changes.insert(key.clone(), Value::Null);
            }
        }
        changes
    }
}

/// Keyed map of `networkId -> NetworkState`. States are created at first
/// use, live for the owning resource's lifetime, and are cleared on
/// deletion.
#[derive(Clone, Default)]
pub struct NetworkStateStore {
    states: Arc<RwLock<HashMap<String, NetworkState>>>,
}

impl NetworkStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_for(&self, network_id: &str) -> NetworkState {
        {
            let states = self
                .states
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(state) = states.get(network_id) {
                return state.clone();
            }
        }
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states
            .entry(network_id.to_string())
            .or_insert_with(NetworkState::new)
            .clone()
    }

    pub fn get(&self, network_id: &str) -> Option<NetworkState> {
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.get(network_id).cloned()
    }

    pub fn watch<F>(&self, network_id: &str, watcher: F) -> u64
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.state_for(network_id).watch(watcher)
    }

    pub fn clear(&self, network_id: &str) {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.remove(network_id);
    }

    pub fn network_ids(&self) -> Vec<String> {
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_returns_old_and_new_values() {
        let state = NetworkState::new();
        let first = state.set("counter", json!(1));
        assert_eq!(first.old_value, None);
        assert_eq!(first.new_value, json!(1));

        let second = state.set("counter", json!(2));
        assert_eq!(second.old_value, Some(json!(1)));
        assert_eq!(second.new_value, json!(2));
    }

    #[test]
    fn update_is_idempotent() {
        let state = NetworkState::new();
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), json!("x"));
        entries.insert("b".to_string(), json!(2));

        state.update(&entries);
        let once = state.snapshot();
        state.update(&entries);
        assert_eq!(once, state.snapshot());
    }

    #[test]
    fn diff_reports_added_changed_and_deleted_keys() {
        let state = NetworkState::new();
        state.set("keep", json!(1));
        state.set("change", json!("before"));
        state.set("drop", json!(true));
        let before = state.snapshot();

        state.set("change", json!("after"));
        state.set("added", json!([1, 2]));
        state.delete("drop");

        let diff = state.diff_from(&before);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["change"], json!("after"));
        assert_eq!(diff["added"], json!([1, 2]));
        assert_eq!(diff["drop"], Value::Null);
        assert!(!diff.contains_key("keep"));
    }

    #[test]
    fn store_creates_state_at_first_use_and_clears_on_delete() {
        let store = NetworkStateStore::new();
        assert!(store.get("default.net").is_none());

        let state = store.state_for("default.net");
        state.set("k", json!("v"));
        assert_eq!(
            store.state_for("default.net").get("k"),
            Some(json!("v"))
        );

        store.clear("default.net");
        assert!(store.get("default.net").is_none());
    }

    #[test]
    fn watchers_observe_writes() {
        let state = NetworkState::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();
        let id = state.watch(move |key, value| {
            sink.write().unwrap().push((key.to_string(), value.clone()));
        });

        state.set("x", json!(1));
        state.unwatch(id);
        state.set("x", json!(2));

        let observed = seen.read().unwrap();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0], ("x".to_string(), json!(1)));
    }
}
