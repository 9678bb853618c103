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

pub mod validator;

pub use validator::{CompiledSchema, SchemaIssue};

use crate::errors::{RuntimeError, RuntimeResult};
use crate::resources::{is_dns_subdomain, CrdSpec, Resource};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct RegisteredCrd {
    pub group: String,
    pub kind: String,
    pub plural: String,
    pub schema: Value,
    validator: Arc<CompiledSchema>,
}

/// Registry of user-defined kinds keyed by `"{group}/{kind}"`. A failed
/// registration never disturbs the previous entry for the same key.
#[derive(Clone, Default)]
pub struct CrdEngine {
    registry: Arc<RwLock<HashMap<String, RegisteredCrd>>>,
}

impl CrdEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: &CrdSpec) -> RuntimeResult<()> {
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

        // Compile first so a broken schema never replaces a registration.
        let validator = CompiledSchema::compile(&spec.validation.open_api_v3_schema)?;

        let registered = RegisteredCrd {
            group: spec.group.clone(),
            kind: spec.names.kind.clone(),
            plural: spec.names.plural.clone(),
            schema: spec.validation.open_api_v3_schema.clone(),
            validator: Arc::new(validator),
        };
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.insert(spec.registry_key(), registered);
        Ok(())
    }

    pub fn unregister(&self, key: &str) -> bool {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<RegisteredCrd> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.get(key).cloned()
    }

    /// True when some registration exists for the kind regardless of
    /// group; unknown kinds without one are rejected at admission.
    pub fn is_registered_kind(&self, kind: &str) -> bool {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.values().any(|crd| crd.kind == kind)
    }

    pub fn registered_keys(&self) -> Vec<String> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.keys().cloned().collect()
    }

    /// Validates a custom resource's spec against the registration
    /// derived from its `apiVersion` group and `kind`.
    pub fn validate_custom_resource(&self, resource: &Resource) -> RuntimeResult<()> {
        let group = resource
            .api_version
            .split_once('/')
            .map(|(group, _)| group)
            .ok_or_else(|| {
                RuntimeError::Validation(format!(
                    "apiVersion '{}' is not of the form group/version",
                    resource.api_version
                ))
            })?;
        let key = format!("{}/{}", group, resource.kind.as_str());
        let registered = self.get(&key).ok_or_else(|| {
            RuntimeError::NotFound(format!("no CustomResourceDefinition registered for {key}"))
        })?;

        let spec_value = resource.spec.to_value()?;
        let issues = registered.validator.validate(&spec_value);
        if issues.is_empty() {
            return Ok(());
        }
        let details = issues
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(RuntimeError::Validation(format!(
            "{} '{}' failed validation: {}",
            resource.kind,
            resource.resource_id(),
            details
        )))
    }
}
