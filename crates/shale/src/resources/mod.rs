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

pub mod specs;
pub mod store;

pub use specs::{
    AgentSpec, CrdNames, CrdScope, CrdSpec, CrdValidation, LlmSpec, LogFormat, LogLevel,
    LoggingConfig, MastraPodSpec, MemoryConfig, ModelRef, NetworkAgentRef, NetworkRouter,
    NetworkSpec, NetworkStatePolicy, PodResourceEntry, ResourceSpec, RoutingKind, ToolSpec,
    ToolType, WorkflowSpec,
};
pub use store::{ResourceStore, StoreChange};

use crate::errors::{RuntimeError, RuntimeResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub const API_VERSION: &str = "mastra.ai/v1";
pub const API_VERSION_ALIAS: &str = "mastra/v1";

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

pub fn is_dns_subdomain(value: &str) -> bool {
    !value.is_empty() && value.len() <= 253 && DNS_SUBDOMAIN.is_match(value)
}

pub fn is_core_api_version(value: &str) -> bool {
    value == API_VERSION || value == API_VERSION_ALIAS
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Agent,
    Tool,
    Workflow,
    Network,
    Llm,
    CustomResourceDefinition,
    MastraPod,
    Custom(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Agent => "Agent",
            ResourceKind::Tool => "Tool",
            ResourceKind::Workflow => "Workflow",
            ResourceKind::Network => "Network",
            ResourceKind::Llm => "LLM",
            ResourceKind::CustomResourceDefinition => "CustomResourceDefinition",
            ResourceKind::MastraPod => "MastraPod",
            ResourceKind::Custom(kind) => kind,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, ResourceKind::Custom(_))
    }
}

impl From<&str> for ResourceKind {
    fn from(value: &str) -> Self {
        match value {
            "Agent" => ResourceKind::Agent,
            "Tool" => ResourceKind::Tool,
            "Workflow" => ResourceKind::Workflow,
            "Network" => ResourceKind::Network,
            "LLM" => ResourceKind::Llm,
            "CustomResourceDefinition" => ResourceKind::CustomResourceDefinition,
            "MastraPod" => ResourceKind::MastraPod,
            other => ResourceKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResourceKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ResourceKind::from(raw.as_str()))
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            uid: None,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            deletion_timestamp: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if !is_dns_subdomain(&self.name) {
            return Err(RuntimeError::Validation(format!(
                "metadata.name '{}' is not a DNS subdomain",
                self.name
            )));
        }
        if !is_dns_subdomain(&self.namespace) {
            return Err(RuntimeError::Validation(format!(
                "metadata.namespace '{}' is not a DNS subdomain",
                self.namespace
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Degraded,
    Terminating,
    Unknown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Degraded => "Degraded",
            Phase::Terminating => "Terminating",
            Phase::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub phase: Phase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl Default for ResourceStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Pending,
            conditions: Vec::new(),
            details: HashMap::new(),
        }
    }
}

impl ResourceStatus {
    /// At most one condition per type. The transition time only refreshes
    /// when the status value actually changes.
    pub fn set_condition(
        &mut self,
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let condition_type = condition_type.into();
        let reason = reason.into();
        let message = message.into();
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
        } else {
            self.conditions.push(Condition {
                condition_type,
                status,
                reason,
                message,
                last_transition_time: Utc::now(),
            });
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_ready(&self) -> bool {
        self.condition("Ready")
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn resource_id(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    pub spec: ResourceSpec,
    pub status: Option<ResourceStatus>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    api_version: String,
    kind: ResourceKind,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<ResourceStatus>,
}

impl Resource {
    pub fn new(kind: ResourceKind, metadata: ObjectMeta, spec: ResourceSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata,
            spec,
            status: None,
        }
    }

    pub fn agent(metadata: ObjectMeta, spec: AgentSpec) -> Self {
        Self::new(ResourceKind::Agent, metadata, ResourceSpec::Agent(spec))
    }

    pub fn tool(metadata: ObjectMeta, spec: ToolSpec) -> Self {
        Self::new(ResourceKind::Tool, metadata, ResourceSpec::Tool(spec))
    }

    pub fn workflow(metadata: ObjectMeta, spec: WorkflowSpec) -> Self {
        Self::new(
            ResourceKind::Workflow,
            metadata,
            ResourceSpec::Workflow(spec),
        )
    }

    pub fn network(metadata: ObjectMeta, spec: NetworkSpec) -> Self {
        Self::new(ResourceKind::Network, metadata, ResourceSpec::Network(spec))
    }

    pub fn llm(metadata: ObjectMeta, spec: LlmSpec) -> Self {
        Self::new(ResourceKind::Llm, metadata, ResourceSpec::Llm(spec))
    }

    pub fn crd(metadata: ObjectMeta, spec: CrdSpec) -> Self {
        Self::new(
            ResourceKind::CustomResourceDefinition,
            metadata,
            ResourceSpec::CustomResourceDefinition(spec),
        )
    }

    pub fn custom(api_version: impl Into<String>, kind: impl Into<String>, metadata: ObjectMeta, spec: Value) -> Self {
        let kind = kind.into();
        Self {
            api_version: api_version.into(),
            kind: ResourceKind::Custom(kind.clone()),
            metadata,
            spec: ResourceSpec::Custom { kind, value: spec },
            status: None,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            self.kind.clone(),
            self.metadata.namespace.clone(),
            self.metadata.name.clone(),
        )
    }

    pub fn resource_id(&self) -> String {
        format!("{}.{}", self.metadata.namespace, self.metadata.name)
    }

    pub fn status(&self) -> ResourceStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(Phase::Unknown)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Envelope validation shared by every kind: api version, identity
    /// fields, and spec/kind agreement.
    pub fn validate_envelope(&self) -> RuntimeResult<()> {
        self.metadata.validate()?;
        match &self.kind {
            ResourceKind::Custom(_) => {
                if !self.api_version.contains('/') {
                    return Err(RuntimeError::Validation(format!(
                        "apiVersion '{}' is not of the form group/version",
                        self.api_version
                    )));
                }
            }
            _ => {
                if !is_core_api_version(&self.api_version) {
                    return Err(RuntimeError::Validation(format!(
                        "apiVersion '{}' is not recognised for kind {}",
                        self.api_version, self.kind
                    )));
                }
            }
        }
        if self.spec.kind() != self.kind {
            return Err(RuntimeError::Validation(format!(
                "spec does not match kind {}",
                self.kind
            )));
        }
        Ok(())
    }

    /// Admission-time defaulting happens on a copy; stored specs are
    /// never mutated in place.
    pub fn with_admission_defaults(&self) -> Resource {
        let mut admitted = self.clone();
        if admitted.metadata.uid.is_none() {
            admitted.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if admitted.status.is_none() {
            admitted.status = Some(ResourceStatus::default());
        }
        admitted
    }

    fn from_raw(raw: RawResource) -> RuntimeResult<Self> {
        let spec = ResourceSpec::from_value(&raw.kind, raw.spec)?;
        Ok(Self {
            api_version: raw.api_version,
            kind: raw.kind,
            metadata: raw.metadata,
            spec,
            status: raw.status,
        })
    }

    fn to_raw(&self) -> RuntimeResult<RawResource> {
        Ok(RawResource {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            metadata: self.metadata.clone(),
            spec: self.spec.to_value()?,
            status: self.status.clone(),
        })
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = self.to_raw().map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawResource::deserialize(deserializer)?;
        Resource::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_subdomain_rules() {
        assert!(is_dns_subdomain("my-agent"));
        assert!(is_dns_subdomain("team.data-designer"));
        assert!(!is_dns_subdomain("My-Agent"));
        assert!(!is_dns_subdomain("-edge"));
        assert!(!is_dns_subdomain(""));
    }

    #[test]
    fn condition_transition_time_only_moves_on_status_change() {
        let mut status = ResourceStatus::default();
        status.set_condition("Ready", ConditionStatus::False, "Pending", "waiting");
        let first = status.condition("Ready").unwrap().last_transition_time;

        status.set_condition("Ready", ConditionStatus::False, "Pending", "still waiting");
        assert_eq!(
            status.condition("Ready").unwrap().last_transition_time,
            first
        );
        assert_eq!(status.condition("Ready").unwrap().message, "still waiting");

        status.set_condition("Ready", ConditionStatus::True, "Reconciled", "ok");
        assert!(status.condition("Ready").unwrap().last_transition_time >= first);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn envelope_round_trips_through_yaml() {
        let yaml = r#"
apiVersion: mastra.ai/v1
kind: Agent
metadata:
  name: greeter
spec:
  instructions: "You greet people."
  model:
    provider: anthropic
    name: claude-3-5-haiku
"#;
        let resource: Resource = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(resource.kind, ResourceKind::Agent);
        assert_eq!(resource.metadata.namespace, "default");
        assert_eq!(resource.resource_id(), "default.greeter");

        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["spec"]["instructions"], "You greet people.");
        let back: Resource = serde_json::from_value(json).unwrap();
        assert!(matches!(back.spec, ResourceSpec::Agent(_)));
    }

    #[test]
    fn alias_api_version_is_recognised() {
        assert!(is_core_api_version("mastra.ai/v1"));
        assert!(is_core_api_version("mastra/v1"));
        assert!(!is_core_api_version("apps/v1"));
    }
}
