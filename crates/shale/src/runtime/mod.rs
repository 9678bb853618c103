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

pub mod config;
pub mod context;
pub mod pod;
pub mod state_store;

pub use config::RuntimeConfig;
pub use context::RuntimeContext;
pub use pod::{glob_match, is_truthy, substitute_env, PodApplyReport};
pub use state_store::{InMemoryStateStore, StateStore};

use crate::agents::AgentHandle;
use crate::controllers::build_reconcilers;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::{EventBus, Subscription};
use crate::network::{NetworkExecutor, NetworkOptions};
use crate::reconcile::Reconciler;
use crate::resources::{
    MastraPodSpec, MemoryConfig, PodResourceEntry, Phase, Resource, ResourceKey, ResourceKind,
    ResourceSpec,
};
use crate::workflow::{
    ExecutionOptions, ExecutionStatus, WorkflowDefinition, WorkflowExecutionResult,
    WorkflowExecutor,
};
use llm_contracts::ProviderSettings;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn key_from_id(kind: ResourceKind, id: &str) -> ResourceKey {
    match id.split_once('.') {
        Some((namespace, name)) => ResourceKey::new(kind, namespace, name),
        None => ResourceKey::new(kind, "default", id),
    }
}

/// Owns every subsystem and drives the resource lifecycle from admission
/// through reconciliation to deletion.
pub struct RuntimeManager {
    ctx: Arc<RuntimeContext>,
    reconcilers: Arc<HashMap<ResourceKind, Reconciler>>,
    watch_subscriptions: Vec<Subscription>,
}

impl RuntimeManager {
    pub fn new(config: RuntimeConfig) -> Self {
        dotenvy::dotenv().ok();
        let ctx = RuntimeContext::new(config.clone());
        let reconcilers = Arc::new(build_reconcilers(&ctx, config.reconciler));
        Self {
            ctx,
            reconcilers,
            watch_subscriptions: Vec::new(),
        }
    }

    pub fn context(&self) -> Arc<RuntimeContext> {
        self.ctx.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    /// Starts the scheduler and wires store notifications to the
    /// matching reconcilers.
    pub fn start(&mut self) {
        self.ctx.scheduler.start();
        for topic in ["resource:added", "resource:updated"] {
            let reconcilers = self.reconcilers.clone();
            let subscription = self.ctx.bus.subscribe_fn(topic, move |event| {
                let kind = event
                    .payload
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .map(ResourceKind::from);
                let namespace = event.payload.get("namespace").and_then(|v| v.as_str());
                let name = event.payload.get("name").and_then(|v| v.as_str());
                if let (Some(kind), Some(namespace), Some(name)) = (kind, namespace, name) {
                    if let Some(reconciler) = reconcilers.get(&kind) {
                        let reconciler = reconciler.clone();
                        let key = ResourceKey::new(kind, namespace, name);
                        tokio::spawn(async move {
                            let _ = reconciler.reconcile(&key).await;
                        });
                    }
                }
            });
            self.watch_subscriptions.push(subscription);
        }
    }

    /// Stops dispatch; in-flight work completes, queued tasks survive
    /// for the next start.
    pub fn shutdown(&mut self) {
        self.ctx.scheduler.stop();
        for subscription in self.watch_subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }

    /// Admission: defaults on a copy, uid, CRD validation for custom
    /// kinds, insert, then one reconcile round before returning.
    pub async fn add_resource(&self, resource: Resource) -> RuntimeResult<ResourceKey> {
        let admitted = resource.with_admission_defaults();
        admitted.validate_envelope()?;

        match &admitted.kind {
            ResourceKind::Custom(kind) => {
                if !self.ctx.crd.is_registered_kind(kind) {
                    return Err(RuntimeError::Validation(format!(
                        "kind '{kind}' is not recognised and no CustomResourceDefinition matches"
                    )));
                }
                self.ctx.crd.validate_custom_resource(&admitted)?;
            }
            ResourceKind::MastraPod => {
                if let ResourceSpec::MastraPod(spec) = admitted.spec.clone() {
                    self.apply_pod_spec(&spec, Path::new(".")).await?;
                }
                let key = admitted.key();
                self.ctx.store.insert(admitted).await?;
                return Ok(key);
            }
            _ => {}
        }

        let key = admitted.key();
        self.ctx.store.insert(admitted).await?;
        if let Some(reconciler) = self.reconcilers.get(&key.kind) {
            // Admission succeeds even when the first round leaves the
            // resource degraded; retries continue in the background.
            let _ = reconciler.reconcile(&key).await;
        }
        Ok(key)
    }

    /// Deletion: timestamp, Terminating, controller cleanup, removal.
    pub async fn delete_resource(&self, key: &ResourceKey) -> RuntimeResult<()> {
        if !self.ctx.store.contains(key).await {
            return Err(RuntimeError::NotFound(format!("resource {key}")));
        }
        self.ctx.store.set_deletion_timestamp(key).await?;
        match self.reconcilers.get(&key.kind) {
            Some(reconciler) => reconciler.reconcile(key).await,
            None => {
                self.ctx.store.remove(key).await;
                Ok(())
            }
        }
    }

    pub async fn get_resource(&self, key: &ResourceKey) -> Option<Resource> {
        self.ctx.store.get(key).await
    }

    pub async fn list_resources(&self, kind: Option<&ResourceKind>) -> Vec<Resource> {
        self.ctx.store.list(kind).await
    }

    pub fn get_agent(&self, reference: &str) -> Option<Arc<AgentHandle>> {
        self.ctx.agents.get_by_ref(reference, "default")
    }

    pub fn get_workflow(&self, reference: &str) -> Option<Arc<WorkflowDefinition>> {
        self.ctx.workflows.get_by_ref(reference, "default")
    }

    pub fn get_network(&self, reference: &str) -> Option<Arc<NetworkExecutor>> {
        self.ctx.networks.get_by_ref(reference, "default")
    }

    /// Runs a reconciled workflow and writes the execution surface back
    /// onto its resource status.
    pub async fn run_workflow(
        &self,
        reference: &str,
        options: ExecutionOptions,
    ) -> RuntimeResult<WorkflowExecutionResult> {
        let definition = self
            .ctx
            .workflows
            .get_by_ref(reference, "default")
            .ok_or_else(|| RuntimeError::NotFound(format!("workflow '{reference}'")))?;

        let executor = WorkflowExecutor::new(
            definition.clone(),
            self.ctx.scheduler.clone(),
            self.ctx.functions.clone(),
            self.ctx.bus.clone(),
        );
        let result = executor.execute(options).await;

        let key = key_from_id(ResourceKind::Workflow, &definition.id);
        let summary = json!({
            "status": result.status,
            "steps": result.history.len(),
            "error": result.error.as_ref().map(|e| e.message.clone()),
            "finishedAt": result.finished_at,
        });
        let phase = match result.status {
            ExecutionStatus::Completed => Phase::Succeeded,
            _ => Phase::Failed,
        };
        let _ = self
            .ctx
            .store
            .update_status(&key, |status| {
                status.phase = phase;
                status.details.insert("lastExecution".to_string(), summary);
            })
            .await;
        Ok(result)
    }

    /// Runs a reconciled network and mirrors its execution status onto
    /// the resource.
    pub async fn run_network(
        &self,
        reference: &str,
        input: &str,
        options: NetworkOptions,
    ) -> RuntimeResult<String> {
        let executor = self
            .ctx
            .networks
            .get_by_ref(reference, "default")
            .ok_or_else(|| RuntimeError::NotFound(format!("network '{reference}'")))?;

        let result = executor.generate(input, options).await;

        let key = key_from_id(ResourceKind::Network, executor.network_id());
        let network_status = executor.status();
        let failed = result.is_err();
        let _ = self
            .ctx
            .store
            .update_status(&key, |status| {
                if failed {
                    status.phase = Phase::Failed;
                }
                if let Ok(value) = serde_json::to_value(&network_status) {
                    status.details.insert("execution".to_string(), value);
                }
            })
            .await;
        result
    }

    pub fn set_provider_config(&self, name: impl Into<String>, settings: ProviderSettings) {
        let name = name.into();
        {
            let mut config = self
                .ctx
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            config.providers.insert(name.clone(), settings);
        }
        self.ctx
            .bus
            .publish("config.provider.updated", json!({ "provider": name }));
    }

    pub fn set_memory_config(&self, memory: MemoryConfig) {
        {
            let mut config = self
                .ctx
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            config.memory = Some(memory);
        }
        self.ctx.bus.publish("config.updated", json!({}));
    }

    /// Applies a pod document from YAML text: environment substitution,
    /// then every contained document through admission.
    pub async fn apply_pod_yaml(
        &self,
        text: &str,
        base_dir: &Path,
    ) -> RuntimeResult<PodApplyReport> {
        let substituted = substitute_env(text);
        let mut report = PodApplyReport::default();
        for document in serde_yaml::Deserializer::from_str(&substituted) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|error| RuntimeError::Validation(format!("invalid YAML: {error}")))?;
            if value.is_null() {
                continue;
            }
            let resource: Resource = serde_yaml::from_value(value)
                .map_err(|error| RuntimeError::Validation(format!("invalid resource: {error}")))?;
            if let ResourceSpec::MastraPod(spec) = &resource.spec {
                report.merge(self.apply_pod_spec(spec, base_dir).await?);
                self.ctx.store.insert(resource.with_admission_defaults()).await?;
            } else {
                let key = Box::pin(self.add_resource(resource)).await?;
                report.applied.push(key);
            }
        }
        Ok(report)
    }

    async fn apply_pod_spec(
        &self,
        spec: &MastraPodSpec,
        base_dir: &Path,
    ) -> RuntimeResult<PodApplyReport> {
        {
            let mut config = self
                .ctx
                .config
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (name, settings) in &spec.providers {
                config.providers.insert(name.clone(), settings.clone());
            }
            if let Some(memory) = &spec.memory {
                config.memory = Some(memory.clone());
            }
            if let Some(logging) = &spec.logging {
                config.logging = logging.clone();
            }
        }
        for name in spec.providers.keys() {
            self.ctx
                .bus
                .publish("config.provider.updated", json!({ "provider": name }));
        }

        let mut report = PodApplyReport::default();
        for entry in &spec.resources {
            match entry {
                PodResourceEntry::Inline(value) => {
                    let resource: Resource = serde_json::from_value(value.clone())
                        .map_err(|error| {
                            RuntimeError::Validation(format!("invalid inline resource: {error}"))
                        })?;
                    let key = Box::pin(self.add_resource(resource)).await?;
                    report.applied.push(key);
                }
                PodResourceEntry::File { file, when } => {
                    if let Some(condition) = when {
                        if !is_truthy(condition) {
                            report.skipped += 1;
                            continue;
                        }
                    }
                    let path = base_dir.join(file);
                    let text = tokio::fs::read_to_string(&path).await.map_err(|error| {
                        RuntimeError::Config(format!(
                            "cannot read resource file {}: {error}",
                            path.display()
                        ))
                    })?;
                    report.merge(Box::pin(self.apply_pod_yaml(&text, base_dir)).await?);
                }
                PodResourceEntry::Directory { directory, pattern } => {
                    let pattern = pattern.clone().unwrap_or_else(|| "*.yaml".to_string());
                    let dir_path = base_dir.join(directory);
                    let mut entries =
                        tokio::fs::read_dir(&dir_path).await.map_err(|error| {
                            RuntimeError::Config(format!(
                                "cannot read resource directory {}: {error}",
                                dir_path.display()
                            ))
                        })?;
                    let mut files: Vec<PathBuf> = Vec::new();
                    while let Some(entry) = entries.next_entry().await.map_err(|error| {
                        RuntimeError::Config(format!("directory walk failed: {error}"))
                    })? {
                        let path = entry.path();
                        let matches = path
                            .file_name()
                            .and_then(|name| name.to_str())
                            .map(|name| glob_match(&pattern, name))
                            .unwrap_or(false);
                        if matches {
                            files.push(path);
                        }
                    }
                    files.sort();
                    for path in files {
                        let text = tokio::fs::read_to_string(&path).await.map_err(|error| {
                            RuntimeError::Config(format!(
                                "cannot read resource file {}: {error}",
                                path.display()
                            ))
                        })?;
                        report.merge(Box::pin(self.apply_pod_yaml(&text, base_dir)).await?);
                    }
                }
            }
        }
        Ok(report)
    }
}
