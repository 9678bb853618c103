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

use crate::errors::{RuntimeError, RuntimeResult};
use crate::network::{NetworkAgent, NetworkExecutor, RoutingStrategy};
use crate::reconcile::Controller;
use crate::resources::{NetworkSpec, Resource, ResourceKind, ResourceSpec, RoutingKind};
use crate::runtime::RuntimeContext;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct NetworkController {
    ctx: Arc<RuntimeContext>,
}

impl NetworkController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn spec<'a>(&self, resource: &'a Resource) -> RuntimeResult<&'a NetworkSpec> {
        match &resource.spec {
            ResourceSpec::Network(spec) => Ok(spec),
            _ => Err(RuntimeError::Internal(
                "network controller received a non-network spec".to_string(),
            )),
        }
    }

    fn strategy(&self, spec: &NetworkSpec, network_id: &str) -> RoutingStrategy {
        match spec.router.strategy {
            RoutingKind::Custom => match self.ctx.custom_route(network_id) {
                Some(handler) => RoutingStrategy::Custom(handler),
                None => {
                    tracing::warn!(
                        network = network_id,
                        "custom routing requested without a handler; router model drives"
                    );
                    RoutingStrategy::Default
                }
            },
            kind => RoutingStrategy::from(kind),
        }
    }
}

#[async_trait::async_trait]
impl Controller for NetworkController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        if spec.instructions.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "network instructions must not be empty".to_string(),
            ));
        }
        if spec.agents.is_empty() {
            return Err(RuntimeError::Validation(
                "network needs at least one agent".to_string(),
            ));
        }
        if spec.router.max_steps == 0 {
            return Err(RuntimeError::Validation(
                "router maxSteps must be at least 1".to_string(),
            ));
        }
        let mut names: Vec<&str> = spec.agents.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != spec.agents.len() {
            return Err(RuntimeError::Validation(
                "network agent names must be unique".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_dependencies(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        let namespace = &resource.metadata.namespace;

        for agent in &spec.agents {
            if self
                .ctx
                .agents
                .get_by_ref(&agent.agent_ref, namespace)
                .is_none()
            {
                return Err(RuntimeError::Dependency {
                    message: format!(
                        "network agent '{}' references unready agent '{}'",
                        agent.name, agent.agent_ref
                    ),
                    retryable: true,
                });
            }
        }

        let provider = spec.router.model.provider.as_deref().ok_or_else(|| {
            RuntimeError::Config("network router model must name a provider".to_string())
        })?;
        if !self.ctx.adapters.has_router(provider) {
            return Err(RuntimeError::Config(format!(
                "no router model registered for provider '{provider}'"
            )));
        }
        Ok(())
    }

    async fn desired_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        resource.spec.to_value()
    }

    async fn current_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        Ok(self
            .ctx
            .networks
            .fingerprint(&resource.resource_id())
            .unwrap_or(Value::Null))
    }

    async fn apply_state(
        &self,
        resource: &Resource,
        desired: &Value,
        _current: &Value,
    ) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        let namespace = &resource.metadata.namespace;
        let id = resource.resource_id();

        let mut agents = Vec::with_capacity(spec.agents.len());
        for agent_ref in &spec.agents {
            let handle = self
                .ctx
                .agents
                .get_by_ref(&agent_ref.agent_ref, namespace)
                .ok_or_else(|| RuntimeError::Dependency {
                    message: format!("agent '{}' is not reconciled yet", agent_ref.agent_ref),
                    retryable: true,
                })?;
            agents.push(NetworkAgent {
                name: agent_ref.name.clone(),
                role: agent_ref.role.clone(),
                specialties: agent_ref.specialties.clone(),
                description: agent_ref.description.clone(),
                handle,
            });
        }

        let router_config = self.ctx.model_config(&spec.router.model)?;
        let router_model = self.ctx.adapters.build_router(router_config)?;

        let state = self.ctx.network_state.state_for(&id);
        if let Some(policy) = &spec.state {
            if !policy.initial.is_empty() && state.is_empty() {
                state.update(&policy.initial);
            }
        }

        let executor = NetworkExecutor::new(
            id.clone(),
            resource.metadata.name.clone(),
            spec.instructions.clone(),
            agents,
            router_model,
            self.strategy(spec, &id),
            spec.router.max_steps,
            state,
            self.ctx.bus.clone(),
        );
        self.ctx
            .networks
            .register(id, Arc::new(executor), desired.clone());
        Ok(())
    }

    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()> {
        let id = resource.resource_id();
        self.ctx.networks.remove(&id);
        self.ctx.network_state.clear(&id);
        self.ctx
            .bus
            .publish("network.cleaned", json!({ "networkId": id }));
        Ok(())
    }
}
