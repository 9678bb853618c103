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

use llm_contracts::{GenerationRequest, GenerationResponse, LLMAdapter, LLMResult, ModelConfig};
use serde_json::{json, Value};
use shale::workflow::{ExecutionOptions, ExecutionStatus, StepAction, StepTarget, WorkflowStep};
use shale::{
    AgentSpec, ConditionStatus, ModelRef, ObjectMeta, Phase, Resource, ResourceKind,
    RuntimeConfig, RuntimeManager, ToolSpec, ToolType, WorkflowSpec,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct EchoAdapter;

#[async_trait::async_trait]
impl LLMAdapter for EchoAdapter {
    async fn generate(&self, request: GenerationRequest) -> LLMResult<GenerationResponse> {
        Ok(GenerationResponse::text_only(
            request.id,
            "echo",
            format!("reply: {}", request.message),
        ))
    }
}

fn manager_with_mock_provider() -> RuntimeManager {
    let manager = RuntimeManager::new(RuntimeConfig::default());
    manager
        .context()
        .adapters
        .register_adapter("mock", |_config: ModelConfig| {
            Ok(Arc::new(EchoAdapter) as Arc<dyn LLMAdapter>)
        });
    manager
}

fn agent_resource(name: &str) -> Resource {
    Resource::agent(
        ObjectMeta::named(name),
        AgentSpec {
            instructions: "Echo the user.".to_string(),
            model: ModelRef {
                provider: Some("mock".to_string()),
                name: "echo-1".to_string(),
            },
            tools: HashMap::new(),
            memory: None,
        },
    )
}

#[tokio::test]
async fn admission_assigns_defaults_and_reconciles_to_running() {
    let manager = manager_with_mock_provider();
    let key = manager.add_resource(agent_resource("greeter")).await.unwrap();

    let stored = manager.get_resource(&key).await.unwrap();
    assert!(stored.metadata.uid.is_some());
    assert_eq!(stored.metadata.namespace, "default");
    assert_eq!(stored.phase(), Phase::Running);
    assert!(stored.status().is_ready());

    let handle = manager.get_agent("greeter").unwrap();
    assert_eq!(handle.generate("hi").await.unwrap(), "reply: hi");
}

#[tokio::test]
async fn reconcile_is_idempotent_for_an_unchanged_spec() {
    let manager = manager_with_mock_provider();
    let key = manager.add_resource(agent_resource("stable")).await.unwrap();
    let first = manager.get_resource(&key).await.unwrap();

    // Resubmitting the identical spec short-circuits on the diff.
    manager.add_resource(agent_resource("stable")).await.unwrap();
    let second = manager.get_resource(&key).await.unwrap();

    assert_eq!(first.phase(), second.phase());
    let condition = second.status().condition("Reconciling").cloned().unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "NoChange");
}

#[tokio::test]
async fn missing_tool_dependency_degrades_then_recovers() {
    let manager = manager_with_mock_provider();

    let mut spec = AgentSpec {
        instructions: "Use your tools.".to_string(),
        model: ModelRef {
            provider: Some("mock".to_string()),
            name: "echo-1".to_string(),
        },
        tools: HashMap::new(),
        memory: None,
    };
    spec.tools
        .insert("search".to_string(), "searcher".to_string());
    let key = manager
        .add_resource(Resource::agent(ObjectMeta::named("tooled"), spec))
        .await
        .unwrap();

    let degraded = manager.get_resource(&key).await.unwrap();
    assert_ne!(degraded.phase(), Phase::Running);
    let condition = degraded.status().condition("Reconciling").cloned().unwrap();
    assert_eq!(condition.reason, "DependenciesNotReady");

    // The tool arrives; its function binding exists up front.
    manager
        .context()
        .functions
        .register("do-search", |input, _variables| {
            Box::pin(async move { Ok(json!({"found": input})) })
        });
    manager
        .add_resource(Resource::tool(
            ObjectMeta::named("searcher"),
            ToolSpec {
                id: "searcher".to_string(),
                tool_type: ToolType::Function,
                execute: "do-search".to_string(),
                description: None,
                parameters: None,
            },
        ))
        .await
        .unwrap();

    // Re-trigger the agent instead of waiting for backoff.
    manager.add_resource(Resource::agent(
        ObjectMeta::named("tooled"),
        {
            let mut spec = AgentSpec {
                instructions: "Use your tools.".to_string(),
                model: ModelRef {
                    provider: Some("mock".to_string()),
                    name: "echo-1".to_string(),
                },
                tools: HashMap::new(),
                memory: None,
            };
            spec.tools
                .insert("search".to_string(), "searcher".to_string());
            spec
        },
    ))
    .await
    .unwrap();

    let recovered = manager.get_resource(&key).await.unwrap();
    assert_eq!(recovered.phase(), Phase::Running);
    let handle = manager.get_agent("tooled").unwrap();
    let tool = handle.tool("search").unwrap();
    assert_eq!(
        tool.call(json!("query")).await.unwrap(),
        json!({"found": "query"})
    );
}

#[tokio::test]
async fn deletion_runs_cleanup_and_emits_events() {
    let manager = manager_with_mock_provider();
    let deleted_events = Arc::new(AtomicUsize::new(0));
    let witness = deleted_events.clone();
    let _sub = manager.bus().subscribe_fn("resource:deleted", move |_event| {
        witness.fetch_add(1, Ordering::SeqCst);
    });

    let key = manager.add_resource(agent_resource("short-lived")).await.unwrap();
    assert!(manager.get_agent("short-lived").is_some());

    manager.delete_resource(&key).await.unwrap();
    assert!(manager.get_resource(&key).await.is_none());
    assert!(manager.get_agent("short-lived").is_none());
    assert_eq!(deleted_events.load(Ordering::SeqCst), 1);

    let missing = manager.delete_resource(&key).await.unwrap_err();
    assert_eq!(missing.name(), "NotFoundError");
}

#[tokio::test]
async fn workflows_run_end_to_end_through_the_manager() {
    let mut manager = manager_with_mock_provider();
    manager.start();

    manager.add_resource(agent_resource("echo")).await.unwrap();

    let steps = vec![
        WorkflowStep {
            id: "step1".to_string(),
            name: None,
            action: StepAction::Agent {
                agent: "echo".to_string(),
            },
            input: Some(json!({"message": "$message"})),
            output: None,
            next: Some(StepTarget::Step("step2".to_string())),
            timeout: None,
            retries: None,
            retry_delay_ms: None,
            transitions: None,
        },
        WorkflowStep {
            id: "step2".to_string(),
            name: None,
            action: StepAction::Agent {
                agent: "echo".to_string(),
            },
            input: Some(json!({"message": "$step1_output"})),
            output: None,
            next: Some(StepTarget::End),
            timeout: None,
            retries: None,
            retry_delay_ms: None,
            transitions: None,
        },
    ];
    let workflow_key = manager
        .add_resource(Resource::workflow(
            ObjectMeta::named("echo-chain"),
            WorkflowSpec {
                initial_step: "step1".to_string(),
                steps,
            },
        ))
        .await
        .unwrap();

    let result = manager
        .run_workflow(
            "echo-chain",
            ExecutionOptions::default().with_input(json!({"message": "hi"})),
        )
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output, Some(json!("reply: reply: hi")));

    let stored = manager.get_resource(&workflow_key).await.unwrap();
    assert_eq!(stored.phase(), Phase::Succeeded);
    let last = stored.status().details.get("lastExecution").cloned().unwrap();
    assert_eq!(last["steps"], json!(2));

    manager.shutdown();
}

#[tokio::test]
async fn provider_config_updates_rebroadcast() {
    let manager = manager_with_mock_provider();
    let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let witness = events.clone();
    let _sub = manager
        .bus()
        .subscribe_fn("config.provider.updated", move |event| {
            witness.lock().unwrap().push(event.payload.clone());
        });

    manager.set_provider_config(
        "anthropic",
        llm_contracts::ProviderSettings {
            api_key: Some("sk-test".to_string()),
            model: Some("claude-3-5-haiku".to_string()),
            config: HashMap::new(),
        },
    );

    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["provider"], "anthropic");
}

#[tokio::test]
async fn pod_documents_substitute_env_and_honour_when_clauses() {
    std::env::set_var("SHALE_TEST_API_KEY", "sk-pod");
    let manager = manager_with_mock_provider();

    let pod = r#"
apiVersion: mastra.ai/v1
kind: MastraPod
metadata:
  name: app-pod
spec:
  providers:
    mock:
      apiKey: ${env.SHALE_TEST_API_KEY}
  logging:
    level: info
    format: text
  resources:
    - apiVersion: mastra.ai/v1
      kind: Agent
      metadata:
        name: pod-agent
      spec:
        instructions: "From the pod."
        model:
          provider: mock
          name: echo-1
    - file: never-loaded.yaml
      when: "false"
"#;

    let report = manager
        .apply_pod_yaml(pod, std::path::Path::new("."))
        .await
        .unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].kind, ResourceKind::Agent);

    let config = manager.context().runtime_config();
    assert_eq!(
        config.provider("mock").unwrap().api_key.as_deref(),
        Some("sk-pod")
    );
    assert!(manager.get_agent("pod-agent").is_some());
}

#[tokio::test]
async fn pod_directories_load_matching_files_in_sorted_order() {
    let manager = manager_with_mock_provider();
    let dir = tempfile::tempdir().unwrap();
    let resources = dir.path().join("resources");
    std::fs::create_dir_all(&resources).unwrap();
    std::fs::write(
        resources.join("01-agent.yaml"),
        r#"
apiVersion: mastra.ai/v1
kind: Agent
metadata:
  name: dir-agent
spec:
  instructions: "From a directory."
  model:
    provider: mock
    name: echo-1
"#,
    )
    .unwrap();
    std::fs::write(resources.join("ignored.txt"), "not yaml").unwrap();

    let pod = r#"
apiVersion: mastra.ai/v1
kind: MastraPod
metadata:
  name: dir-pod
spec:
  resources:
    - directory: resources
      pattern: "*.yaml"
"#;
    let report = manager.apply_pod_yaml(pod, dir.path()).await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert!(manager.get_agent("dir-agent").is_some());
}

#[tokio::test]
async fn events_follow_the_resource_lifecycle() {
    let manager = manager_with_mock_provider();
    let topics: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let witness = topics.clone();
    let _sub = manager.bus().subscribe_fn("Agent.*", move |event| {
        witness.lock().unwrap().push(event.topic.clone());
    });

    let key = manager.add_resource(agent_resource("observed")).await.unwrap();
    manager.delete_resource(&key).await.unwrap();

    let seen = topics.lock().unwrap().clone();
    assert!(seen.contains(&"Agent.created".to_string()));
    assert!(seen.contains(&"Agent.phase.changed".to_string()));
    assert!(seen.contains(&"Agent.reconciled".to_string()));
    assert!(seen.contains(&"Agent.deleted".to_string()));
}
