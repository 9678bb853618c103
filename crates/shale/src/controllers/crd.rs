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
use crate::resources::{is_dns_subdomain, CrdSpec, Resource, ResourceKind, ResourceSpec};
use crate::runtime::RuntimeContext;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct CrdController {
    ctx: Arc<RuntimeContext>,
}

impl CrdController {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn spec<'a>(&self, resource: &'a Resource) -> RuntimeResult<&'a CrdSpec> {
        match &resource.spec {
            ResourceSpec::CustomResourceDefinition(spec) => Ok(spec),
            _ => Err(RuntimeError::Internal(
                "crd controller received a non-crd spec".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl Controller for CrdController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::CustomResourceDefinition
    }

    async fn validate(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        if !is_dns_subdomain(&spec.group) {
            return Err(RuntimeError::Validation(format!(
                "CRD group '{}' is not a DNS subdomain",
                spec.group
            )));
        }
        if !is_dns_subdomain(&spec.names.plural) {
            return Err(RuntimeError::Validation(format!(
                "CRD plural '{}' is not a DNS subdomain",
                spec.names.plural
            )));
        }
        if spec.names.kind.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "CRD names.kind must not be empty".to_string(),
            ));
        }
        if !spec.validation.open_api_v3_schema.is_object() {
            return Err(RuntimeError::Validation(
                "validation.openAPIV3Schema must be an object".to_string(),
            ));
        }
        Ok(())
    }

    async fn resolve_dependencies(&self, _resource: &Resource) -> RuntimeResult<()> {
        Ok(())
    }

    async fn desired_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        let spec = self.spec(resource)?;
        Ok(json!({
            "group": spec.group,
            "kind": spec.names.kind,
            "schema": spec.validation.open_api_v3_schema,
        }))
    }

    async fn current_state(&self, resource: &Resource) -> RuntimeResult<Value> {
        let spec = self.spec(resource)?;
        Ok(self
            .ctx
            .crd
            .get(&spec.registry_key())
            .map(|registered| {
                json!({
                    "group": registered.group,
                    "kind": registered.kind,
                    "schema": registered.schema,
                })
            })
            .unwrap_or(Value::Null))
    }

    async fn apply_state(
        &self,
        resource: &Resource,
        _desired: &Value,
        _current: &Value,
    ) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        // A failed registration leaves any previous entry in place.
        self.ctx.crd.register(spec)
    }

    async fn cleanup(&self, resource: &Resource) -> RuntimeResult<()> {
        let spec = self.spec(resource)?;
        self.ctx.crd.unregister(&spec.registry_key());
        Ok(())
    }
}
