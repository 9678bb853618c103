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

use super::ResourceKind;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::workflow::WorkflowStep;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind-indexed spec union; the envelope carries the discriminant.
#[derive(Debug, Clone)]
pub enum ResourceSpec {
    Agent(AgentSpec),
    Tool(ToolSpec),
    Workflow(WorkflowSpec),
    Network(NetworkSpec),
    Llm(LlmSpec),
    CustomResourceDefinition(CrdSpec),
    MastraPod(MastraPodSpec),
    Custom { kind: String, value: Value },
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Agent(_) => ResourceKind::Agent,
            ResourceSpec::Tool(_) => ResourceKind::Tool,
            ResourceSpec::Workflow(_) => ResourceKind::Workflow,
            ResourceSpec::Network(_) => ResourceKind::Network,
            ResourceSpec::Llm(_) => ResourceKind::Llm,
            ResourceSpec::CustomResourceDefinition(_) => ResourceKind::CustomResourceDefinition,
            ResourceSpec::MastraPod(_) => ResourceKind::MastraPod,
            ResourceSpec::Custom { kind, .. } => ResourceKind::Custom(kind.clone()),
        }
    }

    pub fn from_value(kind: &ResourceKind, value: Value) -> RuntimeResult<Self> {
        let parse_error = |error: serde_json::Error| {
            RuntimeError::Validation(format!("invalid {kind} spec: {error}"))
        };
        Ok(match kind {
            ResourceKind::Agent => ResourceSpec::Agent(
                serde_json::from_value(value).map_err(parse_error)?,
            ),
            ResourceKind::Tool => {
                ResourceSpec::Tool(serde_json::from_value(value).map_err(parse_error)?)
            }
            ResourceKind::Workflow => {
                ResourceSpec::Workflow(serde_json::from_value(value).map_err(parse_error)?)
            }
            ResourceKind::Network => {
                ResourceSpec::Network(serde_json::from_value(value).map_err(parse_error)?)
            }
            ResourceKind::Llm => {
                ResourceSpec::Llm(serde_json::from_value(value).map_err(parse_error)?)
            }
            ResourceKind::CustomResourceDefinition => ResourceSpec::CustomResourceDefinition(
                serde_json::from_value(value).map_err(parse_error)?,
            ),
            ResourceKind::MastraPod => {
                ResourceSpec::MastraPod(serde_json::from_value(value).map_err(parse_error)?)
            }
            ResourceKind::Custom(kind) => ResourceSpec::Custom {
                kind: kind.clone(),
                value,
            },
        })
    }

    pub fn to_value(&self) -> RuntimeResult<Value> {
        Ok(match self {
            ResourceSpec::Agent(spec) => serde_json::to_value(spec)?,
            ResourceSpec::Tool(spec) => serde_json::to_value(spec)?,
            ResourceSpec::Workflow(spec) => serde_json::to_value(spec)?,
            ResourceSpec::Network(spec) => serde_json::to_value(spec)?,
            ResourceSpec::Llm(spec) => serde_json::to_value(spec)?,
            ResourceSpec::CustomResourceDefinition(spec) => serde_json::to_value(spec)?,
            ResourceSpec::MastraPod(spec) => serde_json::to_value(spec)?,
            ResourceSpec::Custom { value, .. } => value.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub instructions: String,
    pub model: ModelRef,
    /// Logical tool name to Tool resource reference (`name` or `ns.name`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
    Api,
    Database,
    Webhook,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    /// Execution target: a registered function name, URL, or connection
    /// string depending on the tool type.
    pub execute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub initial_step: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingKind {
    Default,
    RoundRobin,
    HistoryBased,
    SemanticMatching,
    Custom,
}

impl Default for RoutingKind {
    fn default() -> Self {
        RoutingKind::Default
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAgentRef {
    pub name: String,
    /// Agent resource reference (`name` or `ns.name`).
    #[serde(rename = "ref")]
    pub agent_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialties: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_max_steps() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRouter {
    pub model: ModelRef,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub strategy: RoutingKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatePolicy {
    /// Keep state across executions of the same resource.
    #[serde(default)]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub initial: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub instructions: String,
    pub agents: Vec<NetworkAgentRef>,
    pub router: NetworkRouter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<NetworkStatePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSpec {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdNames {
    pub kind: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdScope {
    Namespaced,
    Cluster,
}

impl Default for CrdScope {
    fn default() -> Self {
        CrdScope::Namespaced
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdValidation {
    #[serde(rename = "openAPIV3Schema")]
    pub open_api_v3_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdSpec {
    pub group: String,
    pub names: CrdNames,
    #[serde(default)]
    pub scope: CrdScope,
    pub validation: CrdValidation,
}

impl CrdSpec {
    pub fn registry_key(&self) -> String {
        format!("{}/{}", self.group, self.names.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(rename = "type")]
    pub memory_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, Value>,
}

/// One entry of a pod document's `resources` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PodResourceEntry {
    File {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Value>,
    },
    Directory {
        directory: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    Inline(Value),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MastraPodSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub providers: HashMap<String, llm_contracts::ProviderSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub resources: Vec<PodResourceEntry>,
}
