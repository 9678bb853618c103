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
use crate::events::EventBus;
use crate::resources::{
    ConditionStatus, Phase, Resource, ResourceKey, ResourceKind, ResourceStore,
};
use crate::scheduler::retry_delay_ms;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Per-kind reconciliation behaviour. The shared flow (validate, resolve,
/// diff, apply, status) lives in `Reconciler`; implementations supply only
/// the kind-specific pieces.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()>;

    async fn resolve_dependencies(&self, resource: &Resource) -> RuntimeResult<()>;

    async fn desired_state(&self, resource: &Resource) -> RuntimeResult<Value>;

    async fn current_state(&self, resource: &Resource) -> RuntimeResult<Value>;

    async fn apply_state(
        &self,
        resource: &Resource,
        desired: &Value,
        current: &Value,
    ) -> RuntimeResult<()>;

    /// Invoked exactly once when the deletion timestamp is set, before
    /// the store entry is removed.
    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()>;

    /// Phase reported after a successful reconciliation; terminal
    /// one-shot kinds override this with `Succeeded`.
    fn success_phase(&self) -> Phase {
        Phase::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Default)]
struct GuardState {
    in_flight: bool,
    pending: bool,
}

struct RetryState {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

/// Drives one controller. Guarantees at most one reconciliation in flight
/// per resource id; overlapping triggers coalesce into a single follow-up
/// round. Retryable failures reschedule with capped exponential backoff.
#[derive(Clone)]
pub struct Reconciler {
    controller: Arc<dyn Controller>,
    store: ResourceStore,
    bus: EventBus,
    config: ReconcilerConfig,
    guards: Arc<Mutex<HashMap<String, GuardState>>>,
    retries: Arc<Mutex<HashMap<String, RetryState>>>,
}

impl Reconciler {
    pub fn new(
        controller: Arc<dyn Controller>,
        store: ResourceStore,
        bus: EventBus,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            controller,
            store,
            bus,
            config,
            guards: Arc::new(Mutex::new(HashMap::new())),
            retries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.controller.kind()
    }

    pub fn reconcile<'a>(
        &'a self,
        key: &'a ResourceKey,
    ) -> Pin<Box<dyn Future<Output = RuntimeResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let id = key.resource_id();
            {
                let mut guards = self.guards.lock().await;
                let guard = guards.entry(id.clone()).or_default();
                if guard.in_flight {
                    guard.pending = true;
                    return Ok(());
                }
                guard.in_flight = true;
            }

            let mut result = self.reconcile_once(key).await;
            loop {
                let run_again = {
                    let mut guards = self.guards.lock().await;
                    match guards.get_mut(&id) {
                        Some(guard) if guard.pending => {
                            guard.pending = false;
                            true
                        }
                        Some(_) => {
                            guards.remove(&id);
                            false
                        }
                        None => false,
                    }
                };
                if !run_again {
                    break;
                }
                result = self.reconcile_once(key).await;
            }

            match &result {
                Ok(_) => self.cancel_retry(&id).await,
                Err(error) if error.is_retryable() => self.schedule_retry(key.clone()).await,
                Err(_) => self.cancel_retry(&id).await,
            }
            result
        })
    }

    async fn reconcile_once(&self, key: &ResourceKey) -> RuntimeResult<()> {
        let Some(resource) = self.store.get(key).await else {
            // Deleted while queued; nothing left to converge.
            return Ok(());
        };

        if resource.is_terminating() {
            return self.finalise(key, resource).await;
        }

        if let Err(error) = self.controller.validate(&resource).await {
            let message = error.to_string();
            self.store
                .update_status(key, |status| {
                    status.phase = Phase::Failed;
                    status.set_condition(
                        "Reconciling",
                        ConditionStatus::False,
                        "ValidationFailed",
                        message.clone(),
                    );
                })
                .await?;
            self.bus.publish(
                format!("{}.validation.failed", key.kind),
                json!({ "resourceId": key.resource_id(), "error": error.to_string() }),
            );
            return Err(error);
        }

        if let Err(error) = self.controller.resolve_dependencies(&resource).await {
            let message = error.to_string();
            let retryable = error.is_retryable();
            self.store
                .update_status(key, |status| {
                    if retryable {
                        status.set_condition(
                            "Reconciling",
                            ConditionStatus::False,
                            "DependenciesNotReady",
                            message.clone(),
                        );
                    } else {
                        status.phase = Phase::Failed;
                        status.set_condition(
                            "Reconciling",
                            ConditionStatus::False,
                            "DependencyResolutionFailed",
                            message.clone(),
                        );
                    }
                })
                .await?;
            return Err(error);
        }

        let desired = self.controller.desired_state(&resource).await?;
        let current = self.controller.current_state(&resource).await?;
        if desired == current {
            self.store
                .update_status(key, |status| {
                    status.set_condition(
                        "Reconciling",
                        ConditionStatus::False,
                        "NoChange",
                        "desired state already applied",
                    );
                })
                .await?;
            self.publish_reconciled(key, false);
            return Ok(());
        }

        if let Err(error) = self
            .controller
            .apply_state(&resource, &desired, &current)
            .await
        {
            let message = error.to_string();
            let retryable = error.is_retryable();
            self.store
                .update_status(key, |status| {
                    if retryable {
                        status.phase = Phase::Degraded;
                        status.set_condition(
                            "Reconciling",
                            ConditionStatus::False,
                            "ApplyFailed",
                            message.clone(),
                        );
                    } else {
                        status.phase = Phase::Failed;
                        status.set_condition(
                            "Reconciling",
                            ConditionStatus::False,
                            "ApplyFailed",
                            message.clone(),
                        );
                    }
                })
                .await?;
            return Err(error);
        }

        let success_phase = self.controller.success_phase();
        self.store
            .update_status(key, |status| {
                status.phase = success_phase;
                status.set_condition(
                    "Ready",
                    ConditionStatus::True,
                    "Reconciled",
                    "resource is ready",
                );
                status.set_condition(
                    "Reconciling",
                    ConditionStatus::False,
                    "Succeeded",
                    "reconciliation applied",
                );
            })
            .await?;
        self.publish_reconciled(key, true);
        Ok(())
    }

    async fn finalise(&self, key: &ResourceKey, resource: Resource) -> RuntimeResult<()> {
        let already_cleaned = resource
            .status
            .as_ref()
            .and_then(|status| status.condition("CleanedUp"))
            .map(|condition| condition.status == ConditionStatus::True)
            .unwrap_or(false);

        if !already_cleaned {
            self.controller.cleanup(&resource).await?;
            self.store
                .update_status(key, |status| {
                    status.set_condition(
                        "CleanedUp",
                        ConditionStatus::True,
                        "CleanupComplete",
                        "controller cleanup finished",
                    );
                })
                .await?;
        }

        self.store.remove(key).await;
        self.cancel_retry(&key.resource_id()).await;
        Ok(())
    }

    fn publish_reconciled(&self, key: &ResourceKey, changed: bool) {
        self.bus.publish(
            format!("{}.reconciled", key.kind),
            json!({ "resourceId": key.resource_id(), "changed": changed }),
        );
    }

    async fn schedule_retry(&self, key: ResourceKey) {
        let id = key.resource_id();
        let attempts = {
            let mut retries = self.retries.lock().await;
            let entry = retries.entry(id.clone()).or_insert(RetryState {
                attempts: 0,
                timer: None,
            });
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.attempts += 1;
            entry.attempts
        };

        if attempts > self.config.max_attempts {
            tracing::warn!(
                resource = %id,
                attempts,
                "reconcile retries exhausted; marking resource failed"
            );
            let _ = self
                .store
                .update_status(&key, |status| {
                    status.phase = Phase::Failed;
                    status.set_condition(
                        "Reconciling",
                        ConditionStatus::False,
                        "RetriesExhausted",
                        format!("gave up after {attempts} attempts"),
                    );
                })
                .await;
            let mut retries = self.retries.lock().await;
            retries.remove(&id);
            return;
        }

        let delay_ms = retry_delay_ms(attempts, self.config.retry_base_ms, self.config.retry_max_ms);
        tracing::debug!(resource = %id, attempts, delay_ms, "scheduling reconcile retry");

        let reconciler = self.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = reconciler.reconcile(&timer_key).await;
        });

        let mut retries = self.retries.lock().await;
        if let Some(entry) = retries.get_mut(&id) {
            entry.timer = Some(handle);
        }
    }

    async fn cancel_retry(&self, id: &str) {
        let mut retries = self.retries.lock().await;
        if let Some(state) = retries.remove(id) {
            if let Some(timer) = state.timer {
                timer.abort();
            }
        }
    }

    pub async fn pending_retry_count(&self) -> usize {
        let retries = self.retries.lock().await;
        retries.len()
    }
}
