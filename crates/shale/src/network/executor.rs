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

use super::routing::{Router, RoutingStrategy};
use super::state::NetworkState;
use super::{AgentPerformance, NetworkAgent, NetworkStatus, TraceRecord, TraceSummary};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::EventBus;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::Stream;
use llm_contracts::{
    GenerationRequest, LLMError, LLMResult, RouterModel, StreamChunk, ToolDescriptor,
    ToolDispatcher,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

pub type FinishCallback = Arc<dyn Fn(&NetworkRunSummary) + Send + Sync>;

#[derive(Clone, Default)]
pub struct NetworkOptions {
    /// Keys merged into network state before the run starts.
    pub initial_state: Option<HashMap<String, Value>>,
    pub on_finish: Option<FinishCallback>,
}

impl NetworkOptions {
    pub fn with_initial_state(mut self, state: HashMap<String, Value>) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_finish<F>(mut self, callback: F) -> Self
    where
        F: Fn(&NetworkRunSummary) + Send + Sync + 'static,
    {
        self.on_finish = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone)]
pub struct NetworkRunSummary {
    pub output: String,
    pub step_count: u32,
    pub summary: TraceSummary,
}

/// Multi-agent router/worker coordinator. One executor per Network
/// resource; its state instance persists across runs for the resource's
/// lifetime while traces and step accounting reset per run.
#[derive(Clone)]
pub struct NetworkExecutor {
    id: String,
    name: String,
    instructions: String,
    agents: Vec<NetworkAgent>,
    router_model: Arc<dyn RouterModel>,
    max_steps: u32,
    router: Arc<Router>,
    state: NetworkState,
    performance: Arc<RwLock<HashMap<String, AgentPerformance>>>,
    traces: Arc<RwLock<Vec<TraceRecord>>>,
    step_count: Arc<AtomicU32>,
    status: Arc<RwLock<NetworkStatus>>,
    bus: EventBus,
}

impl NetworkExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
        agents: Vec<NetworkAgent>,
        router_model: Arc<dyn RouterModel>,
        strategy: RoutingStrategy,
        max_steps: u32,
        state: NetworkState,
        bus: EventBus,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            agents,
            router_model,
            max_steps,
            router: Arc::new(Router::new(strategy)),
            state,
            performance: Arc::new(RwLock::new(HashMap::new())),
            traces: Arc::new(RwLock::new(Vec::new())),
            step_count: Arc::new(AtomicU32::new(0)),
            status: Arc::new(RwLock::new(NetworkStatus::default())),
            bus,
        }
    }

    pub fn network_id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    pub fn step_count(&self) -> u32 {
        self.step_count.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> NetworkStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn execution_trace(&self) -> Vec<TraceRecord> {
        self.traces
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn trace_summary(&self) -> TraceSummary {
        TraceSummary::from_traces(&self.execution_trace(), self.step_count())
    }

    pub fn performance(&self) -> HashMap<String, AgentPerformance> {
        self.performance
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn generate(&self, input: &str, options: NetworkOptions) -> RuntimeResult<String> {
        self.begin_run(&options);

        let output = match self.router.strategy() {
            RoutingStrategy::Default => {
                let before = self.state.snapshot();
                let started = Utc::now();
                let request = self.router_request(input);
                let toolset = NetworkToolset {
                    executor: self.clone(),
                };
                let result = self.router_model.run(request, &toolset).await;
                let finished = Utc::now();
                match result {
                    Ok(response) => {
                        self.push_router_trace(input, &response.text, started, finished, &before);
                        Ok(response.text)
                    }
                    Err(error) => Err(RuntimeError::from(error)),
                }
            }
            _ => self
                .route_to(input)
                .await
                .map(|outcome| outcome.response),
        };

        match output {
            Ok(text) => {
                let summary = self.finish_run(&text);
                if let Some(callback) = &options.on_finish {
                    callback(&summary);
                }
                self.bus.publish(
                    "network.complete",
                    json!({ "networkId": self.id, "steps": summary.step_count }),
                );
                Ok(text)
            }
            Err(error) => {
                self.bus.publish(
                    "network.error",
                    json!({ "networkId": self.id, "error": error.to_string() }),
                );
                Err(error)
            }
        }
    }

    /// Streaming variant: the router's stream is forwarded while the
    /// wrapper appends the router trace, refreshes the status surface,
    /// and then invokes the caller's `on_finish`.
    pub async fn stream(
        &self,
        input: &str,
        options: NetworkOptions,
    ) -> RuntimeResult<BoxStream<'static, StreamChunk>> {
        self.begin_run(&options);

        let before = self.state.snapshot();
        let started = Utc::now();
        let request = self.router_request(input);
        let toolset = NetworkToolset {
            executor: self.clone(),
        };
        let inner = self
            .router_model
            .run_stream(request, &toolset)
            .await
            .map_err(RuntimeError::from)?;

        let executor = self.clone();
        let input = input.to_string();
        let on_finish = options.on_finish.clone();
        let on_done = Box::new(move |collected: String| {
            let finished = Utc::now();
            executor.push_router_trace(&input, &collected, started, finished, &before);
            let summary = executor.finish_run(&collected);
            if let Some(callback) = &on_finish {
                callback(&summary);
            }
            executor.bus.publish(
                "network.complete",
                json!({ "networkId": executor.id, "steps": summary.step_count }),
            );
        });

        Ok(Box::pin(FinishingStream {
            inner,
            collected: String::new(),
            on_done: Some(on_done),
        }))
    }

    /// Applies the configured strategy, invokes the chosen worker and
    /// reports `{agentUsed, response, state}`.
    pub async fn route_to(&self, input: &str) -> RuntimeResult<RouteOutcome> {
        let performance = self.performance();
        let history = self.execution_trace();
        let chosen = self
            .router
            .select(input, &self.agents, &performance, &self.state, &history)?;
        let response = self.invoke_agent(&chosen, input, None).await?;
        Ok(RouteOutcome {
            agent_used: chosen,
            response,
            state: self.state.snapshot(),
        })
    }

    /// Worker invocation with step accounting. Only worker calls move
    /// `step_count`; crossing `max_steps` is fatal for the offending
    /// call.
    pub async fn invoke_agent(
        &self,
        agent_name: &str,
        message: &str,
        state_patch: Option<HashMap<String, Value>>,
    ) -> RuntimeResult<String> {
        let agent = self
            .agents
            .iter()
            .find(|agent| agent.name == agent_name)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::NotFound(format!("agent '{agent_name}' is not part of the network"))
            })?;

        if self.step_count.load(Ordering::SeqCst) >= self.max_steps {
            return Err(RuntimeError::Execution(format!(
                "network '{}' exceeded its step budget of {}",
                self.name, self.max_steps
            )));
        }

        let before = self.state.snapshot();
        if let Some(patch) = state_patch {
            self.state.update(&patch);
        }

        let started = Utc::now();
        let result = agent.handle.generate(message).await;
        let finished = Utc::now();
        let latency = (finished - started).num_milliseconds().max(0) as u64;

        let step = self.step_count.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut performance = self
                .performance
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            performance
                .entry(agent.name.clone())
                .or_default()
                .record(result.is_ok(), latency);
        }

        let output = match &result {
            Ok(text) => text.clone(),
            Err(error) => error.to_string(),
        };
        {
            let mut traces = self
                .traces
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            traces.push(TraceRecord {
                id: uuid::Uuid::new_v4().to_string(),
                step,
                agent_id: agent.name.clone(),
                input: message.to_string(),
                output,
                start_time: started,
                end_time: finished,
                latency,
                is_router_call: false,
                state_changes: self.state.diff_from(&before),
            });
        }

        self.bus.publish(
            "network.message",
            json!({ "networkId": self.id, "agent": agent.name, "step": step }),
        );
        result
    }

    fn begin_run(&self, options: &NetworkOptions) {
        self.step_count.store(0, Ordering::SeqCst);
        self.traces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        if let Some(initial) = &options.initial_state {
            self.state.update(initial);
        }
        self.bus
            .publish("network.start", json!({ "networkId": self.id }));
    }

    fn router_request(&self, input: &str) -> GenerationRequest {
        GenerationRequest::new(input).with_system_prompt(self.instructions.clone())
    }

    fn push_router_trace(
        &self,
        input: &str,
        output: &str,
        started: chrono::DateTime<Utc>,
        finished: chrono::DateTime<Utc>,
        state_before: &HashMap<String, Value>,
    ) {
        let mut traces = self
            .traces
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        traces.push(TraceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            step: self.step_count.load(Ordering::SeqCst),
            agent_id: "router".to_string(),
            input: input.to_string(),
            output: output.to_string(),
            start_time: started,
            end_time: finished,
            latency: (finished - started).num_milliseconds().max(0) as u64,
            is_router_call: true,
            state_changes: self.state.diff_from(state_before),
        });
    }

    fn finish_run(&self, output: &str) -> NetworkRunSummary {
        let step_count = self.step_count();
        let summary = self.trace_summary();
        {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            status.step_count = step_count;
            status.last_execution_time = Some(Utc::now());
            status.last_execution_summary = Some(summary.clone());
        }
        NetworkRunSummary {
            output: output.to_string(),
            step_count,
            summary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub agent_used: String,
    pub response: String,
    pub state: HashMap<String, Value>,
}

/// The synthesized toolset a router model drives for one run.
pub struct NetworkToolset {
    executor: NetworkExecutor,
}

fn tool_error(error: RuntimeError) -> LLMError {
    LLMError::Tool(error.to_string())
}

#[async_trait::async_trait]
impl ToolDispatcher for NetworkToolset {
    fn tools(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .executor
            .agents
            .iter()
            .map(|agent| ToolDescriptor {
                name: format!("agent.{}", agent.name),
                description: agent.matching_text(),
                parameters: json!({
                    "type": "object",
                    "required": ["message"],
                    "properties": {
                        "message": {"type": "string"},
                        "state": {"type": "object"},
                    },
                }),
            })
            .collect();
        descriptors.push(ToolDescriptor {
            name: "network.getState".to_string(),
            description: "Read one key of the shared network state".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["key"],
                "properties": {"key": {"type": "string"}, "defaultValue": {}},
            }),
        });
        descriptors.push(ToolDescriptor {
            name: "network.setState".to_string(),
            description: "Write one key of the shared network state".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["key", "value"],
                "properties": {"key": {"type": "string"}, "value": {}},
            }),
        });
        descriptors.push(ToolDescriptor {
            name: "network.routeTo".to_string(),
            description: "Route an input to the best agent under the configured strategy"
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["input"],
                "properties": {"input": {"type": "string"}},
            }),
        });
        descriptors.push(ToolDescriptor {
            name: "network.getExecutionTrace".to_string(),
            description: "Inspect the execution trace of the current run".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"summary": {"type": "boolean"}},
            }),
        });
        descriptors
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> LLMResult<Value> {
        if let Some(agent_name) = name.strip_prefix("agent.") {
            let message = arguments
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let state_patch = arguments.get("state").and_then(|v| v.as_object()).map(
                |fields| {
                    fields
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect::<HashMap<String, Value>>()
                },
            );
            let response = self
                .executor
                .invoke_agent(agent_name, &message, state_patch)
                .await
                .map_err(tool_error)?;
            return Ok(json!({ "response": response }));
        }

        match name {
            "network.getState" => {
                let key = arguments
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LLMError::Tool("getState requires a key".to_string()))?;
                let default_value = arguments.get("defaultValue").cloned().unwrap_or(Value::Null);
                Ok(self.executor.state.get_or(key, default_value))
            }
            "network.setState" => {
                let key = arguments
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LLMError::Tool("setState requires a key".to_string()))?;
                let value = arguments.get("value").cloned().unwrap_or(Value::Null);
                let change = self.executor.state.set(key, value);
                self.executor.bus.publish(
                    "Network.state.updated",
                    json!({ "networkId": self.executor.id, "key": key }),
                );
                Ok(serde_json::to_value(change)?)
            }
            "network.routeTo" => {
                let input = arguments
                    .get("input")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LLMError::Tool("routeTo requires an input".to_string()))?;
                let outcome = self.executor.route_to(input).await.map_err(tool_error)?;
                Ok(json!({
                    "agentUsed": outcome.agent_used,
                    "response": outcome.response,
                    "state": outcome.state,
                }))
            }
            "network.getExecutionTrace" => {
                let summarise = arguments
                    .get("summary")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if summarise {
                    Ok(serde_json::to_value(self.executor.trace_summary())?)
                } else {
                    Ok(serde_json::to_value(self.executor.execution_trace())?)
                }
            }
            other => Err(LLMError::Tool(format!("unknown tool '{other}'"))),
        }
    }
}

/// Forwards an inner stream and runs a finalisation hook once the inner
/// stream is exhausted.
struct FinishingStream {
    inner: BoxStream<'static, StreamChunk>,
    collected: String,
    on_done: Option<Box<dyn FnOnce(String) + Send>>,
}

impl Stream for FinishingStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                this.collected.push_str(&chunk.content_delta);
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                if let Some(on_done) = this.on_done.take() {
                    on_done(std::mem::take(&mut this.collected));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
