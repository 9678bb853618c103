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
use crate::reconcile::Controller;
use crate::resources::{LlmSpec, Resource, ResourceKind, ResourceSpec};
use crate::runtime::RuntimeContext;
use llm_contracts::ModelConfig;
use serde_json::Value;
use std::sync::Arc;

pub struct LlmController {
    ctx: Arc<RuntimeContext>,
}

impl LlmController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn spec<'a>(&self, resource: &'a Resource) -> RuntimeResult<&'a LlmSpec> {
        match &resource.spec {
            ResourceSpec::Llm(spec) => Ok(spec),
            _ => Err(RuntimeError::Internal(
                "llm controller received a non-llm spec".to_string(),
            )),
        }
    }

    fn model_config(&self, spec: &LlmSpec) -> ModelConfig {
        let mut config = ModelConfig::new(spec.provider.clone(), spec.model.clone());
        if let Some(api_key) = &spec.api_key {
            config = config.with_api_key(api_key.clone());
        }
        for (key, value) in &spec.options {
            config = config.with_option(key.clone(), value.clone());
        }
        if let Some(settings) = self.ctx.runtime_config().provider(&spec.provider) {
            config = config.merge_settings(settings);
        }
        config
    }
}

#[async_trait::async_trait]
impl Controller for LlmController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Llm
    }

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        if spec.provider.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "llm provider must not be empty".to_string(),
            ));
        }
        if spec.model.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "llm model must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_dependencies(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        if !self.ctx.adapters.has_adapter(&spec.provider) {
            return Err(RuntimeError::Config(format!(
                "no adapter registered for provider '{}'",
                spec.provider
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
            .llms
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
        let adapter = self.ctx.adapters.build_adapter(self.model_config(spec))?;
        self.ctx
            .llms
            .register(resource.resource_id(), adapter, desired.clone());
        Ok(())
    }

    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()> {
        self.ctx.llms.remove(&resource.resource_id());
        Ok(())
    }
}
