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

use crate::agents::AgentHandle;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::reconcile::Controller;
use crate::resources::{AgentSpec, Resource, ResourceKind, ResourceSpec};
use crate::runtime::RuntimeContext;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct AgentController {
    ctx: Arc<RuntimeContext>,
}

impl AgentController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn spec<'a>(&self, resource: &'a Resource) -> RuntimeResult<&'a AgentSpec> {
        match &resource.spec {
            ResourceSpec::Agent(spec) => Ok(spec),
            _ => Err(RuntimeError::Internal(
                "agent controller received a non-agent spec".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl Controller for AgentController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Agent
    }

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        if spec.instructions.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "agent instructions must not be empty".to_string(),
            ));
        }
        if spec.model.name.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "agent model name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_dependencies(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        let namespace = &resource.metadata.namespace;

        for (alias, tool_ref) in &spec.tools {
            let exists = self
                .ctx
                .store
                .get_by_ref(ResourceKind::Tool, tool_ref, namespace)
                .await
                .is_some();
            if !exists {
                return Err(RuntimeError::Dependency {
                    message: format!("tool '{alias}' references missing Tool '{tool_ref}'"),
                    retryable: true,
                });
            }
        }

        match &spec.model.provider {
            Some(provider) => {
                if !self.ctx.adapters.has_adapter(provider) {
                    return Err(RuntimeError::Config(format!(
                        "no adapter registered for provider '{provider}'"
                    )));
                }
            }
            None => {
                let exists = self
                    .ctx
                    .store
                    .get_by_ref(ResourceKind::Llm, &spec.model.name, namespace)
                    .await
                    .is_some();
                if !exists {
                    return Err(RuntimeError::Dependency {
                        message: format!(
                            "agent model references missing LLM resource '{}'",
                            spec.model.name
                        ),
                        retryable: true,
                    });
                }
            }
        }
        Ok(())
    }

    async fn desired_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        resource.spec.to_value()
    }

    async fn current_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        Ok(self
            .ctx
            .agents
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

        let (model_config, adapter) = self
            .ctx
            .resolve_agent_adapter(&spec.model, namespace)
            .await?;

        let mut tools = HashMap::new();
        for (alias, tool_ref) in &spec.tools {
            let handle = self
                .ctx
                .tools
                .get_by_ref(tool_ref, namespace)
                .ok_or_else(|| RuntimeError::Dependency {
                    message: format!("tool '{tool_ref}' is not reconciled yet"),
                    retryable: true,
                })?;
            tools.insert(alias.clone(), handle);
        }

        let handle = AgentHandle::new(
            id.clone(),
            resource.metadata.name.clone(),
            spec.instructions.clone(),
            model_config,
            adapter,
        )
        .with_tools(tools);
        self.ctx
            .agents
            .register(id, Arc::new(handle), desired.clone());
        Ok(())
    }

    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()> {
        self.ctx.agents.remove(&resource.resource_id());
        Ok(())
    }
}
