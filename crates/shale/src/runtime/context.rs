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

use super::config::RuntimeConfig;
use super::state_store::{InMemoryStateStore, StateStore};
use crate::agents::{AdapterRegistry, AgentHandle, FunctionRegistry, HandleRegistry, ToolHandle};
use crate::crd::CrdEngine;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::EventBus;
use crate::network::routing::CustomRouteHandler;
use crate::network::{NetworkExecutor, NetworkStateStore};
use crate::resources::{ModelRef, ResourceKind, ResourceStore};
use crate::scheduler::ResourceScheduler;
use crate::workflow::WorkflowDefinition;
use llm_contracts::{LLMAdapter, ModelConfig};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared subsystems of one runtime instance. Controllers and executors
/// receive this by `Arc`; all interior state carries its own lock.
pub struct RuntimeContext {
    pub bus: EventBus,
    pub store: ResourceStore,
    pub scheduler: ResourceScheduler,
    pub crd: CrdEngine,
    pub adapters: AdapterRegistry,
    pub functions: FunctionRegistry,
    pub agents: HandleRegistry<AgentHandle>,
    pub tools: HandleRegistry<ToolHandle>,
    pub llms: HandleRegistry<dyn LLMAdapter>,
    pub workflows: HandleRegistry<WorkflowDefinition>,
    pub networks: HandleRegistry<NetworkExecutor>,
    pub network_state: NetworkStateStore,
    pub state_store: Arc<dyn StateStore>,
    pub config: RwLock<RuntimeConfig>,
    pub custom_routes: RwLock<HashMap<String, CustomRouteHandler>>,
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let bus = EventBus::new();
        let store = ResourceStore::new(bus.clone());
        let scheduler = ResourceScheduler::new(config.scheduler.clone(), bus.clone());
        Arc::new(Self {
            bus,
            store,
            scheduler,
            crd: CrdEngine::new(),
            adapters: AdapterRegistry::new(),
            functions: FunctionRegistry::new(),
            agents: HandleRegistry::new(),
            tools: HandleRegistry::new(),
            llms: HandleRegistry::new(),
            workflows: HandleRegistry::new(),
            networks: HandleRegistry::new(),
            network_state: NetworkStateStore::new(),
            state_store: Arc::new(InMemoryStateStore::new()),
            config: RwLock::new(config),
            custom_routes: RwLock::new(HashMap::new()),
        })
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Builds the model binding for a `model` reference, folding in any
    /// provider-level defaults from the runtime configuration.
    pub fn model_config(&self, model: &ModelRef) -> RuntimeResult<ModelConfig> {
        let provider = model.provider.clone().ok_or_else(|| {
            RuntimeError::Config(format!(
                "model '{}' does not name a provider and is not an LLM resource reference",
                model.name
            ))
        })?;
        let mut config = ModelConfig::new(provider.clone(), model.name.clone());
        if let Some(settings) = self.runtime_config().provider(&provider) {
            config = config.merge_settings(settings);
        }
        Ok(config)
    }

    /// Resolves the adapter behind an agent's `model` field: a named
    /// provider goes through the adapter registry, a provider-less name
    /// is a reference to an admitted LLM resource.
    pub async fn resolve_agent_adapter(
        &self,
        model: &ModelRef,
        namespace: &str,
    ) -> RuntimeResult<(ModelConfig, Arc<dyn LLMAdapter>)> {
        match &model.provider {
            Some(_) => {
                let config = self.model_config(model)?;
                let adapter = self.adapters.build_adapter(config.clone())?;
                Ok((config, adapter))
            }
            None => {
                let adapter =
                    self.llms
                        .get_by_ref(&model.name, namespace)
                        .ok_or_else(|| RuntimeError::Dependency {
                            message: format!(
                                "LLM resource '{}' is not ready",
                                model.name
                            ),
                            retryable: true,
                        })?;
                let llm_resource = self
                    .store
                    .get_by_ref(ResourceKind::Llm, &model.name, namespace)
                    .await
                    .ok_or_else(|| RuntimeError::Dependency {
                        message: format!("LLM resource '{}' does not exist", model.name),
                        retryable: true,
                    })?;
                let config = match &llm_resource.spec {
                    crate::resources::ResourceSpec::Llm(spec) => {
                        let mut config = ModelConfig::new(spec.provider.clone(), spec.model.clone());
                        if let Some(api_key) = &spec.api_key {
                            config = config.with_api_key(api_key.clone());
                        }
                        config
                    }
                    _ => {
                        return Err(RuntimeError::Internal(
                            "LLM reference resolved to a non-LLM spec".to_string(),
                        ))
                    }
                };
                Ok((config, adapter))
            }
        }
    }

    pub fn custom_route(&self, network_id: &str) -> Option<CustomRouteHandler> {
        self.custom_routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(network_id)
            .cloned()
    }

    pub fn set_custom_route(&self, network_id: impl Into<String>, handler: CustomRouteHandler) {
        self.custom_routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(network_id.into(), handler);
    }
}
