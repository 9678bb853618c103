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

use crate::errors::{RuntimeError, RuntimeResult};
use crate::reconcile::Controller;
use crate::resources::{Resource, ResourceKind, ResourceSpec, WorkflowSpec};
use crate::runtime::RuntimeContext;
use crate::workflow::{graph, StepAction, WorkflowDefinition, WorkflowStep};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct WorkflowController {
    ctx: Arc<RuntimeContext>,
}

impl WorkflowController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn spec<'a>(&self, resource: &'a Resource) -> RuntimeResult<&'a WorkflowSpec> {
        match &resource.spec {
            ResourceSpec::Workflow(spec) => Ok(spec),
            _ => Err(RuntimeError::Internal(
                "workflow controller received a non-workflow spec".to_string(),
            )),
        }
    }
}

/// Walks a step tree, visiting parallel branches too.
fn visit_steps<'a>(steps: &'a [WorkflowStep], visit: &mut dyn FnMut(&'a WorkflowStep)) {
    for step in steps {
        visit(step);
        if let StepAction::Parallel { steps } = &step.action {
            visit_steps(steps, visit);
        }
    }
}

#[async_trait::async_trait]
impl Controller for WorkflowController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Workflow
    }

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        graph::validate(spec)
    }

    async fn resolve_dependencies(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        let namespace = &resource.metadata.namespace;

        let mut agent_refs = Vec::new();
        let mut function_refs = Vec::new();
        visit_steps(&spec.steps, &mut |step| match &step.action {
            StepAction::Agent { agent } => agent_refs.push(agent.clone()),
            StepAction::Function { function } => function_refs.push(function.clone()),
            StepAction::Condition { condition } => function_refs.push(condition.clone()),
            StepAction::Parallel { .. } => {}
        });

        for agent_ref in agent_refs {
            if self.ctx.agents.get_by_ref(&agent_ref, namespace).is_none() {
                return Err(RuntimeError::Dependency {
                    message: format!("workflow references unready agent '{agent_ref}'"),
                    retryable: true,
                });
            }
        }
        for function_ref in function_refs {
            if !self.ctx.functions.contains(&function_ref) {
                return Err(RuntimeError::Dependency {
                    message: format!("workflow references unregistered function '{function_ref}'"),
                    retryable: true,
                });
            }
        }
        Ok(())
    }

    async fn desired_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        resource.spec.to_value()
    }

    async fn current_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        Ok(self
            .ctx
            .workflows
            .fingerprint(&resource.resource_id())
            .unwrap_or(Value::Null))
    }

    async fn apply_state(
        &self,
        resource: &Resource,
        desired: &Value,
        _current: &Value,
    ) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        let namespace = &resource.metadata.namespace;
        let id = resource.resource_id();

        let mut agents = HashMap::new();
        let mut missing = None;
        visit_steps(&spec.steps, &mut |step| {
            if let StepAction::Agent { agent } = &step.action {
                match self.ctx.agents.get_by_ref(agent, namespace) {
                    Some(handle) => {
                        agents.insert(agent.clone(), handle);
                    }
                    None => missing = Some(agent.clone()),
                }
            }
        });
        if let Some(agent_ref) = missing {
            return Err(RuntimeError::Dependency {
                message: format!("agent '{agent_ref}' is not reconciled yet"),
                retryable: true,
            });
        }

        let definition = WorkflowDefinition {
            id: id.clone(),
            spec: spec.clone(),
            agents,
        };
        self.ctx
            .workflows
            .register(id, Arc::new(definition), desired.clone());
        Ok(())
    }

    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()> {
        self.ctx.workflows.remove(&resource.resource_id());
        Ok(())
    }
}
