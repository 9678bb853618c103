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

pub mod agents;
pub mod controllers;
pub mod crd;
pub mod errors;
pub mod events;
pub mod logging;
pub mod network;
pub mod reconcile;
pub mod resources;
pub mod runtime;
pub mod scheduler;
pub mod workflow;

pub use agents::{
    AdapterRegistry, AgentHandle, FunctionRegistry, HandleRegistry, HostFunction, ToolHandle,
};
pub use crd::{CompiledSchema, CrdEngine, SchemaIssue};
pub use errors::{ErrorClass, RuntimeError, RuntimeResult};
pub use events::{BusEvent, EventBus, EventHandler, Subscription};
pub use network::{
    AgentPerformance, NetworkAgent, NetworkExecutor, NetworkOptions, NetworkRunSummary,
    NetworkState, NetworkStateStore, NetworkStatus, Router, RoutingStrategy, TraceRecord,
    TraceSummary,
};
pub use reconcile::{Controller, Reconciler, ReconcilerConfig};
pub use resources::{
    AgentSpec, Condition, ConditionStatus, CrdSpec, LlmSpec, LoggingConfig, MastraPodSpec,
    MemoryConfig, ModelRef, NetworkAgentRef, NetworkRouter, NetworkSpec, ObjectMeta, Phase,
    PodResourceEntry, Resource, ResourceKey, ResourceKind, ResourceSpec, ResourceStatus,
    ResourceStore, RoutingKind, ToolSpec, ToolType, WorkflowSpec,
};
pub use runtime::{
    InMemoryStateStore, PodApplyReport, RuntimeConfig, RuntimeContext, RuntimeManager, StateStore,
};
pub use scheduler::{
    ResourceScheduler, SchedulerConfig, SchedulerSnapshot, TaskHandle, TaskPriority, TaskRequest,
    TaskResult, TaskStatus,
};
pub use workflow::{
    ExecutionOptions, ExecutionStatus, StepAction, StepOutcome, StepRecord, StepTarget,
    VariableScope, WorkflowDefinition, WorkflowExecutionResult, WorkflowExecutor, WorkflowStep,
};

use std::sync::Arc;

/// Builds a runtime with the given configuration; `start` remains the
/// caller's move so provider adapters can register first.
pub fn create_runtime(config: RuntimeConfig) -> RuntimeManager {
    RuntimeManager::new(config)
}

/// One-shot helper mirroring the common embedding flow: admit a
/// workflow's resources, reconcile, execute.
pub async fn execute_workflow(
    manager: &RuntimeManager,
    reference: &str,
    options: ExecutionOptions,
) -> RuntimeResult<WorkflowExecutionResult> {
    manager.run_workflow(reference, options).await
}

/// Convenience accessor mirroring `getAgent` on the manager surface.
pub fn agent_of(manager: &RuntimeManager, reference: &str) -> Option<Arc<AgentHandle>> {
    manager.get_agent(reference)
}
