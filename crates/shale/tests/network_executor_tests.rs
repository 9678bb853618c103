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

use futures::StreamExt;
use llm_contracts::{
    GenerationRequest, GenerationResponse, LLMAdapter, LLMResult, ModelConfig, RouterModel,
    ToolDispatcher,
};
use serde_json::{json, Value};
use shale::network::state::NetworkState;
use shale::{
    AgentHandle, EventBus, NetworkAgent, NetworkExecutor, NetworkOptions, RoutingStrategy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct NamedAdapter {
    name: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl LLMAdapter for NamedAdapter {
    async fn generate(&self, request: GenerationRequest) -> LLMResult<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerationResponse::text_only(
            request.id,
            "test-model",
            format!("{} handled: {}", self.name, request.message),
        ))
    }
}

fn worker(name: &str, role: Option<&str>, specialties: Option<&str>) -> (NetworkAgent, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let adapter = Arc::new(NamedAdapter {
        name: name.to_string(),
        calls: calls.clone(),
    });
    let agent = NetworkAgent {
        name: name.to_string(),
        role: role.map(String::from),
        specialties: specialties.map(String::from),
        description: None,
        handle: Arc::new(AgentHandle::new(
            format!("default.{name}"),
            name,
            "worker",
            ModelConfig::new("anthropic", "test-model"),
            adapter,
        )),
    };
    (agent, calls)
}

/// Router model that issues a fixed sequence of tool calls, then returns
/// the last tool response as its text.
struct ScriptedRouter {
    calls: Vec<(String, Value)>,
}

#[async_trait::async_trait]
impl RouterModel for ScriptedRouter {
    async fn run(
        &self,
        request: GenerationRequest,
        tools: &dyn ToolDispatcher,
    ) -> LLMResult<GenerationResponse> {
        let mut last = Value::Null;
        for (name, arguments) in &self.calls {
            last = tools.call_tool(name, arguments.clone()).await?;
        }
        Ok(GenerationResponse::text_only(
            request.id,
            "router-model",
            last.to_string(),
        ))
    }
}

fn executor_with(
    agents: Vec<NetworkAgent>,
    router: Arc<dyn RouterModel>,
    strategy: RoutingStrategy,
    max_steps: u32,
) -> NetworkExecutor {
    NetworkExecutor::new(
        "default.net",
        "net",
        "Coordinate the worker pool.",
        agents,
        router,
        strategy,
        max_steps,
        NetworkState::new(),
        EventBus::new(),
    )
}

#[tokio::test]
async fn semantic_routing_sends_billing_to_the_financial_agent() {
    let (technical, technical_calls) =
        worker("technical", Some("技术支持"), Some("系统故障 性能问题 部署调试"));
    let (customer, customer_calls) =
        worker("customer-service", Some("客服"), Some("投诉处理 咨询服务"));
    let (financial, financial_calls) =
        worker("financial", Some("财务"), Some("账单问题 收费争议 退款处理"));

    let router = Arc::new(ScriptedRouter {
        calls: vec![(
            "network.routeTo".to_string(),
            json!({"input": "我的账单有问题，为什么我被多收费了？"}),
        )],
    });
    let executor = executor_with(
        vec![technical, customer, financial],
        router,
        RoutingStrategy::SemanticMatching,
        10,
    );

    // Drive the toolset the way the router model would.
    let outcome = executor
        .route_to("我的账单有问题，为什么我被多收费了？")
        .await
        .unwrap();

    assert_eq!(outcome.agent_used, "financial");
    assert!(outcome.response.starts_with("financial handled:"));
    assert_eq!(financial_calls.load(Ordering::SeqCst), 1);
    assert_eq!(technical_calls.load(Ordering::SeqCst), 0);
    assert_eq!(customer_calls.load(Ordering::SeqCst), 0);
    assert_eq!(executor.step_count(), 1);

    let traces = executor.execution_trace();
    assert_eq!(traces.len(), 1);
    assert!(!traces[0].is_router_call);
}

#[tokio::test]
async fn default_strategy_lets_the_router_drive_tools() {
    let (alpha, alpha_calls) = worker("alpha", None, None);
    let (beta, _beta_calls) = worker("beta", None, None);

    let router = Arc::new(ScriptedRouter {
        calls: vec![
            (
                "network.setState".to_string(),
                json!({"key": "topic", "value": "billing"}),
            ),
            (
                "agent.alpha".to_string(),
                json!({"message": "take the case", "state": {"assignee": "alpha"}}),
            ),
            ("network.getState".to_string(), json!({"key": "assignee"})),
        ],
    });
    let executor = executor_with(vec![alpha, beta], router, RoutingStrategy::Default, 10);

    let output = executor
        .generate("handle this", NetworkOptions::default())
        .await
        .unwrap();

    assert_eq!(output, "\"alpha\"");
    assert_eq!(alpha_calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.step_count(), 1);
    assert_eq!(executor.state().get("topic"), Some(json!("billing")));

    // Router trace appended on top of the worker trace.
    let traces = executor.execution_trace();
    assert_eq!(traces.len(), 2);
    assert!(traces.iter().any(|t| t.is_router_call));
    let worker_trace = traces.iter().find(|t| !t.is_router_call).unwrap();
    assert_eq!(worker_trace.agent_id, "alpha");
    assert_eq!(worker_trace.state_changes.get("assignee"), Some(&json!("alpha")));

    let summary = executor.trace_summary();
    assert_eq!(summary.total_calls, 2);
    assert_eq!(summary.router_calls, 1);
    assert_eq!(summary.agent_calls, 1);
    assert_eq!(summary.total_steps, 1);
}

#[tokio::test]
async fn step_budget_is_enforced_per_run() {
    let (alpha, alpha_calls) = worker("alpha", None, None);
    let router = Arc::new(ScriptedRouter {
        calls: vec![
            ("agent.alpha".to_string(), json!({"message": "one"})),
            ("agent.alpha".to_string(), json!({"message": "two"})),
            ("agent.alpha".to_string(), json!({"message": "three"})),
        ],
    });
    let executor = executor_with(vec![alpha], router, RoutingStrategy::Default, 2);

    let error = executor
        .generate("overflow", NetworkOptions::default())
        .await
        .unwrap_err();
    assert!(error.to_string().contains("step budget"));
    // Two invocations landed, the third died at the budget check.
    assert_eq!(alpha_calls.load(Ordering::SeqCst), 2);
    assert_eq!(executor.step_count(), 2);
}

#[tokio::test]
async fn round_robin_and_history_based_strategies_cycle_and_score() {
    let (first, first_calls) = worker("first", None, None);
    let (second, second_calls) = worker("second", None, None);
    let router = Arc::new(ScriptedRouter { calls: vec![] });
    let executor = executor_with(
        vec![first, second],
        router,
        RoutingStrategy::RoundRobin,
        10,
    );

    executor.generate("a", NetworkOptions::default()).await.unwrap();
    executor.generate("b", NetworkOptions::default()).await.unwrap();
    executor.generate("c", NetworkOptions::default()).await.unwrap();

    assert_eq!(first_calls.load(Ordering::SeqCst), 2);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);

    // Performance data accumulated across runs feeds the history score.
    let performance = executor.performance();
    assert_eq!(performance["first"].calls, 2);
    assert_eq!(performance["second"].calls, 1);
    assert_eq!(performance["first"].success_rate(), 1.0);
}

#[tokio::test]
async fn set_state_reports_old_and_new_values_through_the_toolset() {
    let (alpha, _calls) = worker("alpha", None, None);
    let router = Arc::new(ScriptedRouter {
        calls: vec![
            (
                "network.setState".to_string(),
                json!({"key": "round", "value": 1}),
            ),
            (
                "network.setState".to_string(),
                json!({"key": "round", "value": 2}),
            ),
        ],
    });
    let executor = executor_with(vec![alpha], router, RoutingStrategy::Default, 10);

    let output = executor
        .generate("state", NetworkOptions::default())
        .await
        .unwrap();
    let last: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(last["oldValue"], json!(1));
    assert_eq!(last["newValue"], json!(2));
}

#[tokio::test]
async fn stream_wraps_on_finish_and_updates_the_status_surface() {
    let (alpha, _calls) = worker("alpha", None, None);
    let router = Arc::new(ScriptedRouter {
        calls: vec![("agent.alpha".to_string(), json!({"message": "stream work"}))],
    });
    let executor = executor_with(vec![alpha], router, RoutingStrategy::Default, 10);

    let finished = Arc::new(Mutex::new(None));
    let witness = finished.clone();
    let options = NetworkOptions::default().on_finish(move |summary| {
        *witness.lock().unwrap() = Some(summary.clone());
    });

    let mut stream = executor.stream("go", options).await.unwrap();
    let mut collected = String::new();
    while let Some(chunk) = stream.next().await {
        collected.push_str(&chunk.content_delta);
    }

    assert!(!collected.is_empty());
    let summary = finished.lock().unwrap().clone().unwrap();
    assert_eq!(summary.step_count, 1);
    assert_eq!(summary.summary.router_calls, 1);

    let status = executor.status();
    assert_eq!(status.step_count, 1);
    assert!(status.last_execution_time.is_some());
    assert!(status.last_execution_summary.is_some());
}

#[tokio::test]
async fn custom_strategy_defers_to_the_handler() {
    let (alpha, alpha_calls) = worker("alpha", None, None);
    let (omega, omega_calls) = worker("omega", None, None);
    let router = Arc::new(ScriptedRouter { calls: vec![] });
    let executor = executor_with(
        vec![alpha, omega],
        router,
        RoutingStrategy::Custom(Arc::new(|_input, agents, _state, _history| {
            agents.last().map(|agent| agent.name.clone())
        })),
        10,
    );

    let outcome = executor.route_to("anything").await.unwrap();
    assert_eq!(outcome.agent_used, "omega");
    assert_eq!(omega_calls.load(Ordering::SeqCst), 1);
    assert_eq!(alpha_calls.load(Ordering::SeqCst), 0);
}
