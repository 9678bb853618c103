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
pub mod requests;
pub mod responses;
pub mod types;

pub use config::{ModelConfig, ProviderSettings};
pub use requests::{GenerationConfig, GenerationRequest, Message};
pub use responses::{GenerationResponse, StreamChunk, Usage};
pub use types::{FinishReason, LLMError, LLMResult, Provider};

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

/// Provider adapter surface. Concrete providers live outside this
/// workspace; the runtime only depends on this contract.
#[async_trait::async_trait]
pub trait LLMAdapter: Send + Sync + std::fmt::Debug {
    async fn generate(&self, request: GenerationRequest) -> LLMResult<GenerationResponse>;

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> LLMResult<BoxStream<'static, StreamChunk>> {
        let request_id = request.id;
        let response = self.generate(request).await?;
        let chunks = vec![
            StreamChunk::delta(request_id, response.text),
            StreamChunk::finished(request_id, response.usage),
        ];
        Ok(stream::iter(chunks).boxed())
    }
}

/// One callable surface exposed to a router model.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Typed tool dispatch handed to a router model for the duration of a
/// single run. Calls are synchronised by the caller.
#[async_trait::async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(&self, name: &str, arguments: Value) -> LLMResult<Value>;
}

/// A model that can drive a toolset to completion, e.g. the router of an
/// agent network. `run` returns the model's final text once it stops
/// issuing tool calls.
#[async_trait::async_trait]
pub trait RouterModel: Send + Sync {
    async fn run(
        &self,
        request: GenerationRequest,
        tools: &dyn ToolDispatcher,
    ) -> LLMResult<GenerationResponse>;

    async fn run_stream(
        &self,
        request: GenerationRequest,
        tools: &dyn ToolDispatcher,
    ) -> LLMResult<BoxStream<'static, StreamChunk>> {
        let request_id = request.id;
        let response = self.run(request, tools).await?;
        let chunks = vec![
            StreamChunk::delta(request_id, response.text),
            StreamChunk::finished(request_id, response.usage),
        ];
        Ok(stream::iter(chunks).boxed())
    }
}
