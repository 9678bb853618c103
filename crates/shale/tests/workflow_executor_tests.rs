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

use llm_contracts::{GenerationRequest, GenerationResponse, LLMAdapter, LLMError, ModelConfig};
use serde_json::{json, Value};
use shale::workflow::{
    ExecutionOptions, ExecutionStatus, StepAction, StepOutcome, StepTarget, WorkflowDefinition,
    WorkflowExecutor, WorkflowStep,
};
use shale::{
    AgentHandle, EventBus, FunctionRegistry, ResourceScheduler, SchedulerConfig, WorkflowSpec,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct EchoAdapter {
    calls: AtomicUsize,
}

impl EchoAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl LLMAdapter for EchoAdapter {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> llm_contracts::LLMResult<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerationResponse::text_only(
            request.id,
            "echo",
            format!("reply: {}", request.message),
        ))
    }
}

#[derive(Debug)]
struct SlowAdapter {
    delay_ms: u64,
}

#[async_trait::async_trait]
impl LLMAdapter for SlowAdapter {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> llm_contracts::LLMResult<GenerationResponse> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(GenerationResponse::text_only(request.id, "slow", "late"))
    }
}

#[derive(Debug)]
struct FlakyAdapter {
    calls: AtomicUsize,
    failures: usize,
}

#[async_trait::async_trait]
impl LLMAdapter for FlakyAdapter {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> llm_contracts::LLMResult<GenerationResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(LLMError::Provider("ETIMEOUT".to_string()))
        } else {
            Ok(GenerationResponse::text_only(request.id, "flaky", "ok"))
        }
    }
}

fn agent_handle(name: &str, adapter: Arc<dyn LLMAdapter>) -> Arc<AgentHandle> {
    Arc::new(AgentHandle::new(
        format!("default.{name}"),
        name,
        "You are a test agent.",
        ModelConfig::new("anthropic", "claude-3-5-haiku"),
        adapter,
    ))
}

fn agent_step(id: &str, agent: &str, input: Value, next: Option<StepTarget>) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: None,
        action: StepAction::Agent {
            agent: agent.to_string(),
        },
        input: Some(input),
        output: None,
        next,
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    }
}

fn harness() -> (EventBus, ResourceScheduler, FunctionRegistry) {
    let bus = EventBus::new();
    let scheduler = ResourceScheduler::new(SchedulerConfig::default(), bus.clone());
    scheduler.start();
    (bus, scheduler, FunctionRegistry::new())
}

fn executor_for(
    spec: WorkflowSpec,
    agents: HashMap<String, Arc<AgentHandle>>,
    scheduler: ResourceScheduler,
    functions: FunctionRegistry,
    bus: EventBus,
) -> WorkflowExecutor {
    let definition = Arc::new(WorkflowDefinition {
        id: "default.flow".to_string(),
        spec,
        agents,
    });
    WorkflowExecutor::new(definition, scheduler, functions, bus)
}

#[tokio::test]
async fn simple_two_step_workflow_completes() {
    let (bus, scheduler, functions) = harness();
    let adapter = EchoAdapter::new();
    let mut agents = HashMap::new();
    agents.insert(
        "echo".to_string(),
        agent_handle("echo", adapter.clone()),
    );

    let spec = WorkflowSpec {
        initial_step: "step1".to_string(),
        steps: vec![
            agent_step(
                "step1",
                "echo",
                json!({"message": "$message"}),
                Some(StepTarget::Step("step2".to_string())),
            ),
            agent_step(
                "step2",
                "echo",
                json!({"message": "$step1_output"}),
                Some(StepTarget::End),
            ),
        ],
    };

    let executor = executor_for(spec, agents, scheduler, functions, bus);
    let result = executor
        .execute(ExecutionOptions::default().with_input(json!({"message": "hi"})))
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Some(json!("reply: reply: hi")));
    assert_eq!(result.history.len(), 2);
    assert!(result
        .history
        .iter()
        .all(|record| record.status == StepOutcome::Success));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn step_timeout_surfaces_as_timeout_error() {
    let (bus, scheduler, functions) = harness();
    let mut agents = HashMap::new();
    agents.insert(
        "sleepy".to_string(),
        agent_handle("sleepy", Arc::new(SlowAdapter { delay_ms: 50 })),
    );

    let mut step = agent_step("only", "sleepy", json!({"message": "go"}), None);
    step.timeout = Some(10);
    let spec = WorkflowSpec {
        initial_step: "only".to_string(),
        steps: vec![step],
    };

    let executor = executor_for(spec, agents, scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.history[0].status, StepOutcome::Timeout);
    assert_eq!(result.error.as_ref().unwrap().name, "TimeoutError");
}

#[tokio::test]
async fn retryable_failures_recover_within_the_step_budget() {
    let (bus, scheduler, functions) = harness();
    let adapter = Arc::new(FlakyAdapter {
        calls: AtomicUsize::new(0),
        failures: 2,
    });
    let mut agents = HashMap::new();
    agents.insert(
        "flaky".to_string(),
        agent_handle("flaky", adapter.clone()),
    );

    let mut step = agent_step("only", "flaky", json!({"message": "go"}), Some(StepTarget::End));
    step.retries = Some(3);
    step.retry_delay_ms = Some(1);
    let spec = WorkflowSpec {
        initial_step: "only".to_string(),
        steps: vec![step],
    };

    let executor = executor_for(spec, agents, scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Some(json!("ok")));
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.history[0].attempt, 3);
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn condition_steps_branch_through_transitions() {
    let (bus, scheduler, functions) = harness();
    functions.register("is-large", |input, _variables| {
        Box::pin(async move {
            let n = input.get("value").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n > 10))
        })
    });
    functions.register("big-path", |_input, _variables| {
        Box::pin(async move { Ok(json!("big")) })
    });
    functions.register("small-path", |_input, _variables| {
        Box::pin(async move { Ok(json!("small")) })
    });

    let mut check = WorkflowStep {
        id: "check".to_string(),
        name: None,
        action: StepAction::Condition {
            condition: "is-large".to_string(),
        },
        input: Some(json!({"value": "$value"})),
        output: None,
        next: None,
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    };
    check.transitions = Some(
        [
            ("true".to_string(), "big".to_string()),
            ("false".to_string(), "small".to_string()),
        ]
        .into_iter()
        .collect(),
    );
    let function_step = |id: &str, function: &str| WorkflowStep {
        id: id.to_string(),
        name: None,
        action: StepAction::Function {
            function: function.to_string(),
        },
        input: None,
        output: None,
        next: Some(StepTarget::End),
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    };

    let spec = WorkflowSpec {
        initial_step: "check".to_string(),
        steps: vec![
            check,
            function_step("big", "big-path"),
            function_step("small", "small-path"),
        ],
    };
    let executor = executor_for(spec, HashMap::new(), scheduler, functions, bus);

    let result = executor
        .execute(ExecutionOptions::default().with_input(json!({"value": 42})))
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Some(json!("big")));

    let result = executor
        .execute(ExecutionOptions::default().with_input(json!({"value": 3})))
        .await;
    assert_eq!(result.output, Some(json!("small")));
}

#[tokio::test]
async fn parallel_output_is_ordered_by_declaration() {
    let (bus, scheduler, functions) = harness();
    functions.register("slowest", |_input, _variables| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(json!("first"))
        })
    });
    functions.register("middle", |_input, _variables| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("second"))
        })
    });
    functions.register("fastest", |_input, _variables| {
        Box::pin(async move { Ok(json!("third")) })
    });

    let branch = |id: &str, function: &str| WorkflowStep {
        id: id.to_string(),
        name: None,
        action: StepAction::Function {
            function: function.to_string(),
        },
        input: None,
        output: None,
        next: None,
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    };
    let spec = WorkflowSpec {
        initial_step: "fanout".to_string(),
        steps: vec![WorkflowStep {
            id: "fanout".to_string(),
            name: None,
            action: StepAction::Parallel {
                steps: vec![
                    branch("a", "slowest"),
                    branch("b", "middle"),
                    branch("c", "fastest"),
                ],
            },
            input: None,
            output: None,
            next: Some(StepTarget::End),
            timeout: None,
            retries: None,
            retry_delay_ms: None,
            transitions: None,
        }],
    };

    let executor = executor_for(spec, HashMap::new(), scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Some(json!(["first", "second", "third"])));
}

#[tokio::test]
async fn next_chain_cycles_are_rejected_before_any_step_runs() {
    let (bus, scheduler, functions) = harness();
    let adapter = EchoAdapter::new();
    let mut agents = HashMap::new();
    agents.insert("echo".to_string(), agent_handle("echo", adapter.clone()));

    let spec = WorkflowSpec {
        initial_step: "a".to_string(),
        steps: vec![
            agent_step("a", "echo", json!({}), Some(StepTarget::Step("b".to_string()))),
            agent_step("b", "echo", json!({}), Some(StepTarget::Step("a".to_string()))),
        ],
    };
    let executor = executor_for(spec, agents, scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_ref().unwrap().name, "CyclicDependencyError");
    assert!(result.history.is_empty());
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_initial_step_rejects_before_any_step_runs() {
    let (bus, scheduler, functions) = harness();
    let spec = WorkflowSpec {
        initial_step: "ghost".to_string(),
        steps: vec![agent_step("real", "echo", json!({}), None)],
    };
    let executor = executor_for(spec, HashMap::new(), scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_ref().unwrap().name, "ValidationError");
    assert!(result.history.is_empty());
}

#[tokio::test]
async fn callbacks_fire_in_order_and_errors_reach_on_error() {
    let (bus, scheduler, functions) = harness();
    let mut agents = HashMap::new();
    agents.insert(
        "echo".to_string(),
        agent_handle("echo", EchoAdapter::new()),
    );

    let spec = WorkflowSpec {
        initial_step: "step1".to_string(),
        steps: vec![agent_step(
            "step1",
            "echo",
            json!({"message": "x"}),
            Some(StepTarget::End),
        )],
    };
    let executor = executor_for(spec, agents, scheduler, functions, bus);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let executed = order.clone();
    let completed_steps = order.clone();
    let completed = order.clone();
    let options = ExecutionOptions::default()
        .on_step_execute(move |step_id, _input| {
            executed.lock().unwrap().push(format!("execute:{step_id}"));
        })
        .on_step_complete(move |record| {
            completed_steps
                .lock()
                .unwrap()
                .push(format!("complete:{}", record.step_id));
        })
        .on_complete(move |_output| {
            completed.lock().unwrap().push("workflow-complete".to_string());
        });

    let result = executor.execute(options).await;
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["execute:step1", "complete:step1", "workflow-complete"]
    );
}

#[tokio::test]
async fn sequential_step_durations_fit_inside_the_run_window() {
    let (bus, scheduler, functions) = harness();
    functions.register("pause", |_input, _variables| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("done"))
        })
    });

    let step = |id: &str, next: Option<StepTarget>| WorkflowStep {
        id: id.to_string(),
        name: None,
        action: StepAction::Function {
            function: "pause".to_string(),
        },
        input: None,
        output: None,
        next,
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    };
    let spec = WorkflowSpec {
        initial_step: "one".to_string(),
        steps: vec![
            step("one", Some(StepTarget::Step("two".to_string()))),
            step("two", Some(StepTarget::End)),
        ],
    };
    let executor = executor_for(spec, HashMap::new(), scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    let total_step_ms: u64 = result.history.iter().map(|record| record.duration_ms).sum();
    let run_ms = (result.finished_at - result.started_at)
        .num_milliseconds()
        .max(0) as u64;
    assert!(total_step_ms <= run_ms + 5);
}

#[tokio::test]
async fn output_mappings_extract_fields_into_variables() {
    let (bus, scheduler, functions) = harness();
    functions.register("produce", |_input, _variables| {
        Box::pin(async move { Ok(json!({"score": 0.9, "label": "good"})) })
    });
    functions.register("consume", |input, _variables| {
        Box::pin(async move { Ok(input) })
    });

    let mut producer = WorkflowStep {
        id: "produce".to_string(),
        name: None,
        action: StepAction::Function {
            function: "produce".to_string(),
        },
        input: None,
        output: Some(
            [("label".to_string(), "label".to_string())]
                .into_iter()
                .collect(),
        ),
        next: Some(StepTarget::Step("consume".to_string())),
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    };
    producer.name = Some("producer".to_string());
    let consumer = WorkflowStep {
        id: "consume".to_string(),
        name: None,
        action: StepAction::Function {
            function: "consume".to_string(),
        },
        input: Some(json!({"label": "$label", "raw": "$produce_output.score"})),
        output: None,
        next: Some(StepTarget::End),
        timeout: None,
        retries: None,
        retry_delay_ms: None,
        transitions: None,
    };

    let spec = WorkflowSpec {
        initial_step: "produce".to_string(),
        steps: vec![producer, consumer],
    };
    let executor = executor_for(spec, HashMap::new(), scheduler, functions, bus);
    let result = executor.execute(ExecutionOptions::default()).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Some(json!({"label": "good", "raw": 0.9})));
}
