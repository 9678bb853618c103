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

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct Entry<T: ?Sized> {
    handle: Arc<T>,
    fingerprint: Value,
}

impl<T: ?Sized> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Registry of executable handles keyed by resource id. The fingerprint
/// is the normalised spec a handle was built from; reconcilers diff
/// against it to decide whether anything changed.
pub struct HandleRegistry<T: ?Sized> {
    entries: Arc<RwLock<HashMap<String, Entry<T>>>>,
}

impl<T: ?Sized> Clone for HandleRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T: ?Sized> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&self, id: impl Into<String>, handle: Arc<T>, fingerprint: Value) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            id.into(),
            Entry {
                handle,
                fingerprint,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(id).map(|entry| entry.handle.clone())
    }

    /// Resolves `name` or `namespace.name` style references.
    pub fn get_by_ref(&self, reference: &str, default_namespace: &str) -> Option<Arc<T>> {
        if reference.contains('.') {
            self.get(reference)
        } else {
            self.get(&format!("{default_namespace}.{reference}"))
        }
    }

    pub fn fingerprint(&self, id: &str) -> Option<Value> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(id).map(|entry| entry.fingerprint.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(id).map(|entry| entry.handle)
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_get_remove() {
        let registry: HandleRegistry<String> = HandleRegistry::new();
        registry.register("default.a", Arc::new("handle".to_string()), json!({"v": 1}));

        assert_eq!(registry.get("default.a").unwrap().as_str(), "handle");
        assert_eq!(registry.fingerprint("default.a"), Some(json!({"v": 1})));
        assert_eq!(
            registry.get_by_ref("a", "default").unwrap().as_str(),
            "handle"
        );
        assert!(registry.get_by_ref("a", "other").is_none());

        registry.remove("default.a");
        assert!(registry.is_empty());
    }
}
