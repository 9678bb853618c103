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

use crate::errors::RuntimeResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub type StateWatcher = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Pluggable persistence driver. Scopes are `network:{id}` for network
/// state and `resource:{kind}` for resource snapshots; the default is
/// in-memory and nothing survives a restart.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> RuntimeResult<Option<Value>>;

    async fn set(&self, scope: &str, key: &str, value: Value) -> RuntimeResult<()>;

    async fn delete(&self, scope: &str, key: &str) -> RuntimeResult<()>;

    fn watch(&self, watcher: StateWatcher) -> u64;

    fn unwatch(&self, id: u64);
}

#[derive(Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, HashMap<String, Value>>>,
    watchers: RwLock<Vec<(u64, StateWatcher)>>,
    next_watcher_id: AtomicU64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, scope: &str, key: &str, value: &Value) {
        let watchers: Vec<StateWatcher> = {
            let watchers = self
                .watchers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            watchers.iter().map(|(_, w)| w.clone()).collect()
        };
        for watcher in watchers {
            watcher(scope, key, value);
        }
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, scope: &str, key: &str) -> RuntimeResult<Option<Value>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(scope).and_then(|scoped| scoped.get(key)).cloned())
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> RuntimeResult<()> {
        {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .entry(scope.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
        }
        self.notify(scope, key, &value);
        Ok(())
    }

    async fn delete(&self, scope: &str, key: &str) -> RuntimeResult<()> {
        let removed = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .get_mut(scope)
                .and_then(|scoped| scoped.remove(key))
                .is_some()
        };
        if removed {
            self.notify(scope, key, &Value::Null);
        }
        Ok(())
    }

    fn watch(&self, watcher: StateWatcher) -> u64 {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, watcher));
        id
    }

    fn unwatch(&self, id: u64) {
        self.watchers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(watcher_id, _)| *watcher_id != id);
    }
}
