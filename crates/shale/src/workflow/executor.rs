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

use super::{
    graph, ErrorInfo, ExecutionOptions, ExecutionStatus, StepAction, StepOutcome, StepRecord,
    StepTarget, VariableScope, WorkflowExecutionResult, WorkflowStep, END_TARGET,
};
use crate::agents::{AgentHandle, FunctionRegistry};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::EventBus;
use crate::resources::{ResourceKind, WorkflowSpec};
use crate::scheduler::{ResourceScheduler, TaskHandler, TaskPriority, TaskRequest, TaskStatus};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A workflow registered by its controller: the frozen spec snapshot and
/// the agent handles its steps resolve to.
pub struct WorkflowDefinition {
    pub id: String,
    pub spec: WorkflowSpec,
    pub agents: HashMap<String, Arc<AgentHandle>>,
}

#[derive(Debug, Clone, Copy)]
struct StepDefaults {
    timeout_ms: u64,
    retries: u32,
    retry_delay_ms: u64,
}

/// Step-graph interpreter. Steps run as scheduler tasks under the
/// `workflow:{id}` group; failures are encoded in the returned result,
/// never raised.
pub struct WorkflowExecutor {
    definition: Arc<WorkflowDefinition>,
    scheduler: ResourceScheduler,
    functions: FunctionRegistry,
    bus: EventBus,
    history: Arc<Mutex<Vec<StepRecord>>>,
}

impl WorkflowExecutor {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        scheduler: ResourceScheduler,
        functions: FunctionRegistry,
        bus: EventBus,
    ) -> Self {
        Self {
            definition,
            scheduler,
            functions,
            bus,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.id
    }

    /// The history so far; live during execution, final afterwards.
    pub fn history(&self) -> Vec<StepRecord> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn execute(&self, options: ExecutionOptions) -> WorkflowExecutionResult {
        let started_at = Utc::now();
        let workflow_id = self.definition.id.clone();
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();

        if let Err(error) = graph::validate(&self.definition.spec) {
            if let Some(callback) = &options.on_error {
                callback(&error);
            }
            self.bus.publish(
                "workflow.failed",
                json!({ "workflowId": workflow_id, "error": error.to_string() }),
            );
            return WorkflowExecutionResult {
                workflow_id,
                status: ExecutionStatus::Failed,
                output: None,
                error: Some(ErrorInfo::from(&error)),
                history: Vec::new(),
                variables: HashMap::new(),
                started_at,
                finished_at: Utc::now(),
            };
        }

        self.bus.publish(
            "workflow.started",
            json!({ "workflowId": workflow_id, "input": options.input }),
        );

        let mut scope = VariableScope::seeded(options.input.clone());
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(self.definition.spec.initial_step.clone());
        let mut last_output = Value::Null;
        let mut failure: Option<RuntimeError> = None;

        'flow: while let Some(step_id) = queue.pop_front() {
            let Some(step) = self
                .definition
                .spec
                .steps
                .iter()
                .find(|step| step.id == step_id)
                .cloned()
            else {
                failure = Some(RuntimeError::Internal(format!(
                    "validated step '{step_id}' disappeared"
                )));
                break 'flow;
            };

            match self.run_step(&step, &mut scope, &options).await {
                Ok(output) => {
                    last_output = output.clone();

                    if let Some(transitions) = &step.transitions {
                        if let Some(target) = transitions.get(&outcome_key(&output)) {
                            if target == END_TARGET {
                                break 'flow;
                            }
                            queue.push_back(target.clone());
                            continue 'flow;
                        }
                    }
                    match &step.next {
                        Some(StepTarget::End) => break 'flow,
                        Some(StepTarget::Step(next_id)) => queue.push_back(next_id.clone()),
                        Some(StepTarget::Many(next_ids)) => {
                            for next_id in next_ids {
                                queue.push_back(next_id.clone());
                            }
                        }
                        None => {}
                    }
                }
                Err(error) => {
                    failure = Some(error);
                    break 'flow;
                }
            }
        }

        let finished_at = Utc::now();
        let history = self.history();
        let variables = scope.snapshot();

        match failure {
            Some(error) => {
                if let Some(callback) = &options.on_error {
                    callback(&error);
                }
                self.bus.publish(
                    "workflow.failed",
                    json!({ "workflowId": workflow_id, "error": error.to_string() }),
                );
                WorkflowExecutionResult {
                    workflow_id,
                    status: ExecutionStatus::Failed,
                    output: None,
                    error: Some(ErrorInfo::from(&error)),
                    history,
                    variables,
                    started_at,
                    finished_at,
                }
            }
            None => {
                if let Some(callback) = &options.on_complete {
                    callback(&last_output);
                }
                self.bus.publish(
                    "workflow.completed",
                    json!({ "workflowId": workflow_id, "output": last_output }),
                );
                WorkflowExecutionResult {
                    workflow_id,
                    status: ExecutionStatus::Completed,
                    output: Some(last_output),
                    error: None,
                    history,
                    variables,
                    started_at,
                    finished_at,
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        scope: &mut VariableScope,
        options: &ExecutionOptions,
    ) -> RuntimeResult<Value> {
        let workflow_id = self.definition.id.clone();
        let resolved_input = scope.resolve_input(step.input.as_ref().unwrap_or(&Value::Null));

        if let Some(callback) = &options.on_step_execute {
            callback(&step.id, &resolved_input);
        }
        self.bus.publish(
            "workflow.step.started",
            json!({ "workflowId": workflow_id, "stepId": step.id }),
        );

        let defaults = StepDefaults {
            timeout_ms: options.default_step_timeout_ms,
            retries: options.default_step_retries,
            retry_delay_ms: options.default_step_retry_delay_ms,
        };
        let handler = build_action_handler(
            self.definition.clone(),
            self.functions.clone(),
            self.scheduler.clone(),
            step.action.clone(),
            resolved_input.clone(),
            scope.snapshot_value(),
            defaults,
        );

        let start_time = Utc::now();
        let request = TaskRequest::new(
            ResourceKind::Workflow,
            format!("{}#{}", workflow_id, step.id),
            move || handler(),
        )
        .with_priority(TaskPriority::Normal)
        .with_group_key(format!("workflow:{workflow_id}"))
        .with_timeout_ms(step.timeout.unwrap_or(defaults.timeout_ms))
        .with_max_retries(step.retries.unwrap_or(defaults.retries))
        .with_retry_delay_ms(step.retry_delay_ms.unwrap_or(defaults.retry_delay_ms));

        let task_result = self.scheduler.submit(request).await?.wait().await?;
        let end_time = Utc::now();
        let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;

        match task_result.status {
            TaskStatus::Completed => {
                let output = task_result.output.unwrap_or(Value::Null);
                scope.record_step_output(&step.id, &output, step.output.as_ref());
                let record = StepRecord {
                    step_id: step.id.clone(),
                    attempt: task_result.attempts,
                    status: StepOutcome::Success,
                    input: resolved_input,
                    output: Some(output.clone()),
                    error: None,
                    start_time,
                    end_time,
                    duration_ms,
                };
                self.push_record(record.clone());
                self.bus.publish(
                    "workflow.step.completed",
                    json!({ "workflowId": self.definition.id, "stepId": step.id }),
                );
                if let Some(callback) = &options.on_step_complete {
                    callback(&record);
                }
                Ok(output)
            }
            _ => {
                let error = task_result.error.unwrap_or_else(|| {
                    RuntimeError::Execution(format!("step '{}' was cancelled", step.id))
                });
                let status = match &error {
                    RuntimeError::Timeout(_) => StepOutcome::Timeout,
                    _ => StepOutcome::Error,
                };
                let record = StepRecord {
                    step_id: step.id.clone(),
                    attempt: task_result.attempts,
                    status,
                    input: resolved_input,
                    output: None,
                    error: Some(error.to_string()),
                    start_time,
                    end_time,
                    duration_ms,
                };
                self.push_record(record);
                self.bus.publish(
                    "workflow.step.failed",
                    json!({
                        "workflowId": self.definition.id,
                        "stepId": step.id,
                        "error": error.to_string(),
                    }),
                );
                Err(error)
            }
        }
    }

    fn push_record(&self, record: StepRecord) {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

/// Maps a step output onto a transition key: booleans become
/// `true`/`false`, strings pass through, everything else serialises.
fn outcome_key(output: &Value) -> String {
    match output {
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The message handed to an agent step: the `message` field when the
/// resolved input carries one, the raw string, or the serialised input.
fn agent_message(input: &Value) -> String {
    match input {
        Value::String(text) => text.clone(),
        Value::Object(fields) => match fields.get("message") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => input.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn build_action_handler(
    definition: Arc<WorkflowDefinition>,
    functions: FunctionRegistry,
    scheduler: ResourceScheduler,
    action: StepAction,
    input: Value,
    variables: Value,
    defaults: StepDefaults,
) -> TaskHandler {
    Arc::new(move || {
        let definition = definition.clone();
        let functions = functions.clone();
        let scheduler = scheduler.clone();
        let action = action.clone();
        let input = input.clone();
        let variables = variables.clone();
        Box::pin(async move {
            match action {
                StepAction::Agent { agent } => {
                    let handle = definition.agents.get(&agent).cloned().ok_or_else(|| {
                        RuntimeError::NotFound(format!("agent '{agent}' is not bound"))
                    })?;
                    let message = agent_message(&input);
                    let text = handle.generate(&message).await?;
                    Ok(Value::String(text))
                }
                StepAction::Function { function } => {
                    let host = functions.get(&function).ok_or_else(|| {
                        RuntimeError::NotFound(format!("function '{function}' is not registered"))
                    })?;
                    host(input, variables).await
                }
                StepAction::Condition { condition } => {
                    let predicate = functions.get(&condition).ok_or_else(|| {
                        RuntimeError::NotFound(format!(
                            "condition '{condition}' is not registered"
                        ))
                    })?;
                    predicate(input, variables).await
                }
                StepAction::Parallel { steps } => {
                    run_parallel(definition, functions, scheduler, steps, variables, defaults)
                        .await
                }
            }
        })
    })
}

/// Every branch runs concurrently as its own scheduler task under the
/// workflow's group; the output is the ordered array of branch outputs
/// and any branch failure fails the whole step.
async fn run_parallel(
    definition: Arc<WorkflowDefinition>,
    functions: FunctionRegistry,
    scheduler: ResourceScheduler,
    steps: Vec<WorkflowStep>,
    variables: Value,
    defaults: StepDefaults,
) -> RuntimeResult<Value> {
    let scope = match &variables {
        Value::Object(fields) => VariableScope::from_map(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        _ => VariableScope::default(),
    };

    let mut branch_futures = Vec::with_capacity(steps.len());
    for sub_step in &steps {
        let resolved_input = scope.resolve_input(sub_step.input.as_ref().unwrap_or(&Value::Null));
        let handler = build_action_handler(
            definition.clone(),
            functions.clone(),
            scheduler.clone(),
            sub_step.action.clone(),
            resolved_input,
            variables.clone(),
            defaults,
        );
        let request = TaskRequest::new(
            ResourceKind::Workflow,
            format!("{}#{}", definition.id, sub_step.id),
            move || handler(),
        )
        .with_priority(TaskPriority::Normal)
        .with_group_key(format!("workflow:{}", definition.id))
        .with_timeout_ms(sub_step.timeout.unwrap_or(defaults.timeout_ms))
        .with_max_retries(sub_step.retries.unwrap_or(defaults.retries))
        .with_retry_delay_ms(sub_step.retry_delay_ms.unwrap_or(defaults.retry_delay_ms));

        let scheduler = scheduler.clone();
        branch_futures.push(async move { scheduler.submit(request).await?.wait().await });
    }

    let mut outputs = Vec::with_capacity(branch_futures.len());
    for branch in join_all(branch_futures).await {
        let task_result = branch?;
        match task_result.status {
            TaskStatus::Completed => outputs.push(task_result.output.unwrap_or(Value::Null)),
            _ => {
                let error = task_result.error.unwrap_or_else(|| {
                    RuntimeError::Execution("parallel branch was cancelled".to_string())
                });
                return Err(error);
            }
        }
    }
    Ok(Value::Array(outputs))
}
