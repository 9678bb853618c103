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

pub mod executor;
pub mod graph;
pub mod variables;

pub use executor::{WorkflowDefinition, WorkflowExecutor};
pub use variables::VariableScope;

use crate::errors::RuntimeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const END_TARGET: &str = "END";

/// One node of a workflow graph. Steps live in the spec's `steps` vector
/// and reference each other by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Variable name to output field extraction applied on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StepTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Symbolic outcome to step id, e.g. `true`/`false` for conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitions: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepAction {
    Agent { agent: String },
    Function { function: String },
    Condition { condition: String },
    Parallel { steps: Vec<WorkflowStep> },
}

/// Where control flows after a step: a named step, the `END` sentinel,
/// or an ordered list of downstream steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTarget {
    End,
    Step(String),
    Many(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawTarget {
    One(String),
    Many(Vec<String>),
}

impl Serialize for StepTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StepTarget::End => serializer.serialize_str(END_TARGET),
            StepTarget::Step(id) => serializer.serialize_str(id),
            StepTarget::Many(ids) => ids.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StepTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawTarget::deserialize(deserializer)? {
            RawTarget::One(id) if id == END_TARGET => StepTarget::End,
            RawTarget::One(id) => StepTarget::Step(id),
            RawTarget::Many(ids) => StepTarget::Many(ids),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Error,
    Timeout,
}

/// One history record per step completion, carrying the final attempt
/// count of the underlying task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub attempt: u32,
    pub status: StepOutcome,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
}

impl From<&RuntimeError> for ErrorInfo {
    fn from(error: &RuntimeError) -> Self {
        Self {
            name: error.name().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionResult {
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub history: Vec<StepRecord>,
    pub variables: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub type StepExecuteCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
pub type StepCompleteCallback = Arc<dyn Fn(&StepRecord) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&RuntimeError) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
pub struct ExecutionOptions {
    pub input: Value,
    pub default_step_timeout_ms: u64,
    pub default_step_retries: u32,
    pub default_step_retry_delay_ms: u64,
    pub on_step_execute: Option<StepExecuteCallback>,
    pub on_step_complete: Option<StepCompleteCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_complete: Option<CompleteCallback>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            input: Value::Object(serde_json::Map::new()),
            default_step_timeout_ms: 30_000,
            default_step_retries: 0,
            default_step_retry_delay_ms: 1000,
            on_step_execute: None,
            on_step_complete: None,
            on_error: None,
            on_complete: None,
        }
    }
}

impl ExecutionOptions {
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_step_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_step_timeout_ms = timeout_ms;
        self
    }

    pub fn with_step_retries(mut self, retries: u32) -> Self {
        self.default_step_retries = retries;
        self
    }

    pub fn with_step_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.default_step_retry_delay_ms = delay_ms;
        self
    }

    pub fn on_step_execute<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.on_step_execute = Some(Arc::new(callback));
        self
    }

    pub fn on_step_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StepRecord) + Send + Sync + 'static,
    {
        self.on_step_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RuntimeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_serde_round_trip_with_end_sentinel() {
        let yaml = r#"
id: step1
type: agent
agent: greeter
input:
  message: "$message"
next: END
timeout: 500
"#;
        let step: WorkflowStep = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(&step.action, StepAction::Agent { agent } if agent == "greeter"));
        assert_eq!(step.next, Some(StepTarget::End));
        assert_eq!(step.timeout, Some(500));

        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "agent");
        assert_eq!(value["next"], "END");
    }

    #[test]
    fn array_next_deserialises_to_many() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "id": "fanout",
            "type": "function",
            "function": "emit",
            "next": ["a", "b"],
        }))
        .unwrap();
        assert_eq!(
            step.next,
            Some(StepTarget::Many(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn parallel_steps_nest() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "id": "par",
            "type": "parallel",
            "steps": [
                {"id": "left", "type": "function", "function": "l"},
                {"id": "right", "type": "function", "function": "r"},
            ],
        }))
        .unwrap();
        match &step.action {
            StepAction::Parallel { steps } => assert_eq!(steps.len(), 2),
            other => panic!("unexpected action {other:?}"),
        }
    }
}
