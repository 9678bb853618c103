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

pub mod registry;

pub use registry::HandleRegistry;

use crate::errors::{RuntimeError, RuntimeResult};
use crate::resources::ToolType;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use llm_contracts::{
    GenerationRequest, LLMAdapter, ModelConfig, RouterModel, StreamChunk,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Host closure bound to workflow function/condition steps and
/// function-type tools. Receives `(resolved_input, variables_snapshot)`.
pub type HostFunction =
    Arc<dyn Fn(Value, Value) -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync>;

/// Named host functions registered by the embedding application.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Arc<RwLock<HashMap<String, HostFunction>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(Value, Value) -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync + 'static,
    {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<HostFunction> {
        let functions = self
            .functions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// Executable tool resolved from a Tool resource at reconcile time.
pub struct ToolHandle {
    pub id: String,
    pub tool_type: ToolType,
    pub description: Option<String>,
    pub execute: String,
    functions: FunctionRegistry,
}

impl ToolHandle {
    pub fn new(
        id: impl Into<String>,
        tool_type: ToolType,
        execute: impl Into<String>,
        description: Option<String>,
        functions: FunctionRegistry,
    ) -> Self {
        Self {
            id: id.into(),
            tool_type,
            description,
            execute: execute.into(),
            functions,
        }
    }

    /// Function tools dispatch through the host function registry; the
    /// remaining transports resolve their binding lazily so a transport
    /// registered after reconcile still works.
    pub async fn call(&self, arguments: Value) -> RuntimeResult<Value> {
        let function = self.functions.get(&self.execute).ok_or_else(|| {
            RuntimeError::Execution(format!(
                "no binding registered for {:?} tool target '{}'",
                self.tool_type, self.execute
            ))
        })?;
        function(arguments, Value::Null).await
    }
}

/// LLM-backed callable resolved from an Agent resource. Executors read a
/// frozen snapshot; the handle never mutates its resource.
pub struct AgentHandle {
    pub id: String,
    pub name: String,
    pub instructions: String,
    pub model: ModelConfig,
    adapter: Arc<dyn LLMAdapter>,
    tools: HashMap<String, Arc<ToolHandle>>,
}

impl AgentHandle {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
        model: ModelConfig,
        adapter: Arc<dyn LLMAdapter>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            model,
            adapter,
            tools: HashMap::new(),
        }
    }

    pub fn with_tools(mut self, tools: HashMap<String, Arc<ToolHandle>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool(&self, name: &str) -> Option<Arc<ToolHandle>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub async fn generate(&self, message: &str) -> RuntimeResult<String> {
        let request =
            GenerationRequest::new(message).with_system_prompt(self.instructions.clone());
        let response = self.adapter.generate(request).await?;
        Ok(response.text)
    }

    pub async fn generate_stream(
        &self,
        message: &str,
    ) -> RuntimeResult<BoxStream<'static, StreamChunk>> {
        let request =
            GenerationRequest::new(message).with_system_prompt(self.instructions.clone());
        Ok(self.adapter.generate_stream(request).await?)
    }
}

type AdapterBuilder =
    Arc<dyn Fn(ModelConfig) -> RuntimeResult<Arc<dyn LLMAdapter>> + Send + Sync>;
type RouterBuilder =
    Arc<dyn Fn(ModelConfig) -> RuntimeResult<Arc<dyn RouterModel>> + Send + Sync>;

/// Provider name to adapter constructor. Concrete providers register here
/// at bootstrap; the runtime itself ships none.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<String, AdapterBuilder>>>,
    routers: Arc<RwLock<HashMap<String, RouterBuilder>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_adapter<F>(&self, provider: impl Into<String>, builder: F)
    where
        F: Fn(ModelConfig) -> RuntimeResult<Arc<dyn LLMAdapter>> + Send + Sync + 'static,
    {
        let mut adapters = self
            .adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        adapters.insert(provider.into(), Arc::new(builder));
    }

    pub fn register_router<F>(&self, provider: impl Into<String>, builder: F)
    where
        F: Fn(ModelConfig) -> RuntimeResult<Arc<dyn RouterModel>> + Send + Sync + 'static,
    {
        let mut routers = self
            .routers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        routers.insert(provider.into(), Arc::new(builder));
    }

    pub fn has_adapter(&self, provider: &str) -> bool {
        let adapters = self
            .adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        adapters.contains_key(provider)
    }

    pub fn has_router(&self, provider: &str) -> bool {
        let routers = self
            .routers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        routers.contains_key(provider)
    }

    pub fn build_adapter(&self, config: ModelConfig) -> RuntimeResult<Arc<dyn LLMAdapter>> {
        let builder = {
            let adapters = self
                .adapters
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            adapters.get(config.provider.as_str()).cloned()
        };
        let builder = builder.ok_or_else(|| {
            RuntimeError::Config(format!(
                "no adapter registered for provider '{}'",
                config.provider.as_str()
            ))
        })?;
        builder(config)
    }

    pub fn build_router(&self, config: ModelConfig) -> RuntimeResult<Arc<dyn RouterModel>> {
        let builder = {
            let routers = self
                .routers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            routers.get(config.provider.as_str()).cloned()
        };
        let builder = builder.ok_or_else(|| {
            RuntimeError::Config(format!(
                "no router model registered for provider '{}'",
                config.provider.as_str()
            ))
        })?;
        builder(config)
    }
}
