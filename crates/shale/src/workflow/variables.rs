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

use serde_json::{Map, Value};
use std::collections::HashMap;

/// Per-execution variable scope. Seeded from the execution input; step
/// outputs land under `{stepId}_output` plus any declared mappings.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    values: HashMap<String, Value>,
}

impl VariableScope {
    pub fn seeded(input: Value) -> Self {
        let mut values = HashMap::new();
        if let Value::Object(fields) = &input {
            for (key, value) in fields {
                values.insert(key.clone(), value.clone());
            }
        }
        values.insert("input".to_string(), input);
        Self { values }
    }

    pub fn from_map(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.clone()
    }

    pub fn snapshot_value(&self) -> Value {
        Value::Object(self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Resolves a `$name` or `$name.nested.path` reference. Unresolvable
    /// references yield `None` so callers can keep the literal.
    pub fn resolve_reference(&self, reference: &str) -> Option<Value> {
        let path = reference.strip_prefix('$')?;
        let mut segments = path.split('.');
        let root = segments.next()?;
        let mut current = self.values.get(root)?;
        for segment in segments {
            current = match current {
                Value::Object(fields) => fields.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Literal substitution over a step input: every leaf string of the
    /// form `$name` is replaced by the referenced value.
    pub fn resolve_input(&self, input: &Value) -> Value {
        match input {
            Value::String(text) if text.starts_with('$') => self
                .resolve_reference(text)
                .unwrap_or_else(|| input.clone()),
            Value::Object(fields) => {
                let resolved: Map<String, Value> = fields
                    .iter()
                    .map(|(key, value)| (key.clone(), self.resolve_input(value)))
                    .collect();
                Value::Object(resolved)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.resolve_input(item)).collect())
            }
            other => other.clone(),
        }
    }

    /// Records a completed step: the raw output under `{stepId}_output`,
    /// then any declared `{var: field}` extractions.
    pub fn record_step_output(
        &mut self,
        step_id: &str,
        output: &Value,
        mappings: Option<&HashMap<String, String>>,
    ) {
        self.values
            .insert(format!("{step_id}_output"), output.clone());
        if let Some(mappings) = mappings {
            for (variable, field) in mappings {
                let extracted = if field.is_empty() {
                    Some(output.clone())
                } else {
                    extract_field(output, field)
                };
                if let Some(value) = extracted {
                    self.values.insert(variable.clone(), value);
                }
            }
        }
    }
}

fn extract_field(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(fields) => fields.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seeding_merges_object_keys_and_keeps_whole_input() {
        let scope = VariableScope::seeded(json!({"message": "hi", "count": 2}));
        assert_eq!(scope.get("message"), Some(&json!("hi")));
        assert_eq!(scope.get("input"), Some(&json!({"message": "hi", "count": 2})));
    }

    #[test]
    fn reference_resolution_descends_paths() {
        let mut scope = VariableScope::seeded(json!({}));
        scope.set("user", json!({"name": "ada", "tags": ["x", "y"]}));

        assert_eq!(scope.resolve_reference("$user.name"), Some(json!("ada")));
        assert_eq!(scope.resolve_reference("$user.tags.1"), Some(json!("y")));
        assert_eq!(scope.resolve_reference("$user.missing"), None);
        assert_eq!(scope.resolve_reference("no-dollar"), None);
    }

    #[test]
    fn input_resolution_substitutes_leaf_strings_only() {
        let mut scope = VariableScope::seeded(json!({"message": "hello"}));
        scope.set("step1_output", json!({"text": "done"}));

        let resolved = scope.resolve_input(&json!({
            "direct": "$message",
            "nested": {"deep": "$step1_output.text"},
            "untouched": "plain",
            "unknown": "$nope",
            "list": ["$message", 3],
        }));
        assert_eq!(
            resolved,
            json!({
                "direct": "hello",
                "nested": {"deep": "done"},
                "untouched": "plain",
                "unknown": "$nope",
                "list": ["hello", 3],
            })
        );
    }

    #[test]
    fn output_recording_applies_mappings() {
        let mut scope = VariableScope::seeded(json!({}));
        let mappings: HashMap<String, String> =
            [("summary".to_string(), "result.text".to_string())]
                .into_iter()
                .collect();
        scope.record_step_output(
            "analyse",
            &json!({"result": {"text": "ok", "score": 0.9}}),
            Some(&mappings),
        );

        assert_eq!(
            scope.get("analyse_output"),
            Some(&json!({"result": {"text": "ok", "score": 0.9}}))
        );
        assert_eq!(scope.get("summary"), Some(&json!("ok")));
    }
}
