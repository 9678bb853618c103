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

use crate::agents::ToolHandle;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::reconcile::Controller;
use crate::resources::{Resource, ResourceKind, ResourceSpec, ToolSpec, ToolType};
use crate::runtime::RuntimeContext;
use serde_json::Value;
use std::sync::Arc;

pub struct ToolController {
    ctx: Arc<RuntimeContext>,
}

impl ToolController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn spec<'a>(&self, resource: &'a Resource) -> RuntimeResult<&'a ToolSpec> {
        match &resource.spec {
            ResourceSpec::Tool(spec) => Ok(spec),
            _ => Err(RuntimeError::Internal(
                "tool controller received a non-tool spec".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl Controller for ToolController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Tool
    }

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        if spec.id.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "tool id must not be empty".to_string(),
            ));
        }
        if spec.execute.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "tool execute target must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_dependencies(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        // Function tools need their host binding up front; the remaining
        // transports resolve lazily at call time.
        if spec.tool_type == ToolType::Function && !self.ctx.functions.contains(&spec.execute) {
            return Err(RuntimeError::Dependency {
                message: format!(
                    "function tool '{}' has no host binding '{}'",
                    spec.id, spec.execute
                ),
                retryable: true,
            });
        }
        Ok(())
    }

    async fn desired_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        resource.spec.to_value()
    }

    async fn current_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        Ok(self
            .ctx
            .tools
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
        let id = resource.resource_id();
        let handle = ToolHandle::new(
            spec.id.clone(),
            spec.tool_type,
            spec.execute.clone(),
            spec.description.clone(),
            self.ctx.functions.clone(),
        );
        self.ctx
            .tools
            .register(id, Arc::new(handle), desired.clone());
        Ok(())
    }

    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()> {
        self.ctx.tools.remove(&resource.resource_id());
        Ok(())
    }
}
