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

use super::{Phase, Resource, ResourceKey, ResourceKind, ResourceStatus};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::{EventBus, EventHandler, Subscription};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Created,
    Updated,
}

/// In-memory resource index. The store owns resource objects exclusively:
/// reads hand out copies, status mutation goes through `update_status`.
#[derive(Clone)]
pub struct ResourceStore {
    resources: Arc<RwLock<HashMap<ResourceKey, Resource>>>,
    bus: EventBus,
}

impl ResourceStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            resources: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn insert(&self, resource: Resource) -> RuntimeResult<StoreChange> {
        resource.validate_envelope()?;
        let key = resource.key();
        let payload = json!({
            "kind": key.kind.as_str(),
            "namespace": key.namespace,
            "name": key.name,
            "resourceId": key.resource_id(),
        });

        let change = {
            let mut resources = self.resources.write().await;
            // Status belongs to the controllers; an update replaces the
            // spec but keeps the reconciled status sub-tree.
            let previous_status = resources.get(&key).map(|existing| existing.status.clone());
            match previous_status {
                Some(status) => {
                    let mut updated = resource;
                    updated.status = status;
                    resources.insert(key.clone(), updated);
                    StoreChange::Updated
                }
                None => {
                    resources.insert(key.clone(), resource);
                    StoreChange::Created
                }
            }
        };

        match change {
            StoreChange::Created => {
                self.bus.publish("resource:added", payload.clone());
                self.bus
                    .publish(format!("{}.created", key.kind), payload);
            }
            StoreChange::Updated => {
                self.bus.publish("resource:updated", payload.clone());
                self.bus
                    .publish(format!("{}.updated", key.kind), payload);
            }
        }
        Ok(change)
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<Resource> {
        let resources = self.resources.read().await;
        resources.get(key).cloned()
    }

    /// Resolves a cross-resource reference of the form `name` or
    /// `namespace.name` against a kind.
    pub async fn get_by_ref(
        &self,
        kind: ResourceKind,
        reference: &str,
        default_namespace: &str,
    ) -> Option<Resource> {
        let key = match reference.split_once('.') {
            Some((namespace, name)) => ResourceKey::new(kind, namespace, name),
            None => ResourceKey::new(kind, default_namespace, reference),
        };
        self.get(&key).await
    }

    pub async fn list(&self, kind: Option<&ResourceKind>) -> Vec<Resource> {
        let resources = self.resources.read().await;
        resources
            .values()
            .filter(|resource| kind.map(|k| &resource.kind == k).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        let resources = self.resources.read().await;
        resources.contains_key(key)
    }

    pub async fn count(&self) -> usize {
        let resources = self.resources.read().await;
        resources.len()
    }

    pub async fn remove(&self, key: &ResourceKey) -> Option<Resource> {
        let removed = {
            let mut resources = self.resources.write().await;
            resources.remove(key)
        };
        if removed.is_some() {
            let payload = json!({
                "kind": key.kind.as_str(),
                "namespace": key.namespace,
                "name": key.name,
                "resourceId": key.resource_id(),
            });
            self.bus.publish("resource:deleted", payload.clone());
            self.bus.publish(format!("{}.deleted", key.kind), payload);
        }
        removed
    }

    /// The single status-write path. Publishes `{kind}.phase.changed`
    /// when the mutation moves the phase.
    pub async fn update_status<F>(&self, key: &ResourceKey, mutate: F) -> RuntimeResult<Resource>
    where
        F: FnOnce(&mut ResourceStatus),
    {
        let (updated, previous_phase, current_phase) = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(key)
                .ok_or_else(|| RuntimeError::NotFound(format!("resource {key}")))?;
            let mut status = resource.status.take().unwrap_or_default();
            let previous_phase = status.phase;
            mutate(&mut status);
            let current_phase = status.phase;
            resource.status = Some(status);
            (resource.clone(), previous_phase, current_phase)
        };

        if previous_phase != current_phase {
            self.bus.publish(
                format!("{}.phase.changed", key.kind),
                json!({
                    "resourceId": key.resource_id(),
                    "previousPhase": previous_phase.to_string(),
                    "currentPhase": current_phase.to_string(),
                }),
            );
        }
        Ok(updated)
    }

    /// Marks the resource for deletion and moves it to `Terminating`.
    pub async fn set_deletion_timestamp(&self, key: &ResourceKey) -> RuntimeResult<Resource> {
        {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(key)
                .ok_or_else(|| RuntimeError::NotFound(format!("resource {key}")))?;
            if resource.metadata.deletion_timestamp.is_none() {
                resource.metadata.deletion_timestamp = Some(Utc::now());
            }
        }
        self.update_status(key, |status| status.phase = Phase::Terminating)
            .await
    }

    /// Watch notifications for one kind, delivered through the bus.
    pub fn watch_kind(
        &self,
        kind: &ResourceKind,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        self.bus.subscribe(format!("{kind}.*"), handler)
    }
}
