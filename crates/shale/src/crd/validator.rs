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
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

static EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static URI: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*:\S+$").unwrap());
static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

#[derive(Debug, Clone)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringFormat {
    DateTime,
    Date,
    Time,
    Email,
    Uri,
    Uuid,
    Hostname,
    Ipv4,
    Ipv6,
}

impl StringFormat {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "date-time" => Some(StringFormat::DateTime),
            "date" => Some(StringFormat::Date),
            "time" => Some(StringFormat::Time),
            "email" => Some(StringFormat::Email),
            "uri" => Some(StringFormat::Uri),
            "uuid" => Some(StringFormat::Uuid),
            "hostname" => Some(StringFormat::Hostname),
            "ipv4" => Some(StringFormat::Ipv4),
            "ipv6" => Some(StringFormat::Ipv6),
            _ => None,
        }
    }

    fn accepts(&self, value: &str) -> bool {
        match self {
            StringFormat::DateTime => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
            StringFormat::Date => {
                chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
            }
            StringFormat::Time => {
                chrono::NaiveTime::parse_from_str(value, "%H:%M:%S").is_ok()
                    || chrono::NaiveTime::parse_from_str(value, "%H:%M:%S%.f").is_ok()
            }
            StringFormat::Email => EMAIL.is_match(value),
            StringFormat::Uri => URI.is_match(value),
            StringFormat::Uuid => uuid::Uuid::parse_str(value).is_ok(),
            StringFormat::Hostname => value.len() <= 253 && HOSTNAME.is_match(value),
            StringFormat::Ipv4 => value.parse::<std::net::Ipv4Addr>().is_ok(),
            StringFormat::Ipv6 => value.parse::<std::net::Ipv6Addr>().is_ok(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            StringFormat::DateTime => "date-time",
            StringFormat::Date => "date",
            StringFormat::Time => "time",
            StringFormat::Email => "email",
            StringFormat::Uri => "uri",
            StringFormat::Uuid => "uuid",
            StringFormat::Hostname => "hostname",
            StringFormat::Ipv4 => "ipv4",
            StringFormat::Ipv6 => "ipv6",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct NumericRules {
    minimum: Option<f64>,
    maximum: Option<f64>,
    exclusive_minimum: Option<f64>,
    exclusive_maximum: Option<f64>,
    multiple_of: Option<f64>,
}

#[derive(Debug, Clone)]
enum AdditionalProperties {
    Allow,
    Deny,
    Schema(Box<CompiledSchema>),
}

#[derive(Debug, Clone)]
enum Dependency {
    Keys(Vec<String>),
    Schema(Box<CompiledSchema>),
}

#[derive(Debug, Clone)]
enum SchemaNode {
    Any,
    Ref,
    String {
        min_length: Option<usize>,
        max_length: Option<usize>,
        pattern: Option<Regex>,
        format: Option<StringFormat>,
    },
    Integer(NumericRules),
    Number(NumericRules),
    Boolean,
    Null,
    Array {
        items: Option<Box<CompiledSchema>>,
        min_items: Option<usize>,
        max_items: Option<usize>,
        unique_items: bool,
    },
    Object {
        properties: HashMap<String, CompiledSchema>,
        required: Vec<String>,
        additional: AdditionalProperties,
        min_properties: Option<usize>,
        max_properties: Option<usize>,
        dependencies: HashMap<String, Dependency>,
    },
    OneOf(Vec<CompiledSchema>),
    AnyOf(Vec<CompiledSchema>),
    AllOf(Vec<CompiledSchema>),
}

/// An OpenAPI-v3-derived validator compiled once at CRD registration.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    enumeration: Option<Vec<Value>>,
    const_value: Option<Value>,
    node: SchemaNode,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> RuntimeResult<Self> {
        let object = schema.as_object().ok_or_else(|| {
            RuntimeError::Validation("schema must be an object".to_string())
        })?;

        let enumeration = object
            .get("enum")
            .and_then(|v| v.as_array())
            .map(|values| values.to_vec());
        let const_value = object.get("const").cloned();

        let node = if object.contains_key("$ref") {
            SchemaNode::Ref
        } else if let Some(subschemas) = object.get("oneOf") {
            SchemaNode::OneOf(Self::compile_list(subschemas)?)
        } else if let Some(subschemas) = object.get("anyOf") {
            SchemaNode::AnyOf(Self::compile_list(subschemas)?)
        } else if let Some(subschemas) = object.get("allOf") {
            SchemaNode::AllOf(Self::compile_list(subschemas)?)
        } else {
            let type_name = object.get("type").and_then(|t| t.as_str());
            match type_name {
                Some("string") => SchemaNode::String {
                    min_length: object.get("minLength").and_then(|v| v.as_u64()).map(|v| v as usize),
                    max_length: object.get("maxLength").and_then(|v| v.as_u64()).map(|v| v as usize),
                    pattern: match object.get("pattern").and_then(|v| v.as_str()) {
                        Some(pattern) => Some(Regex::new(pattern).map_err(|error| {
                            RuntimeError::Validation(format!("invalid pattern '{pattern}': {error}"))
                        })?),
                        None => None,
                    },
                    format: object
                        .get("format")
                        .and_then(|v| v.as_str())
                        .and_then(StringFormat::parse),
                },
                Some("integer") => SchemaNode::Integer(Self::numeric_rules(object)),
                Some("number") => SchemaNode::Number(Self::numeric_rules(object)),
                Some("boolean") => SchemaNode::Boolean,
                Some("null") => SchemaNode::Null,
                Some("array") => SchemaNode::Array {
                    items: match object.get("items") {
                        Some(items) => Some(Box::new(Self::compile(items)?)),
                        None => None,
                    },
                    min_items: object.get("minItems").and_then(|v| v.as_u64()).map(|v| v as usize),
                    max_items: object.get("maxItems").and_then(|v| v.as_u64()).map(|v| v as usize),
                    unique_items: object
                        .get("uniqueItems")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                },
                Some("object") => Self::compile_object(object)?,
                Some(other) => {
                    return Err(RuntimeError::Validation(format!(
                        "unsupported schema type '{other}'"
                    )))
                }
                None if object.contains_key("properties")
                    || object.contains_key("required")
                    || object.contains_key("additionalProperties") =>
                {
                    Self::compile_object(object)?
                }
                None => SchemaNode::Any,
            }
        };

        Ok(Self {
            enumeration,
            const_value,
            node,
        })
    }

    fn compile_list(value: &Value) -> RuntimeResult<Vec<CompiledSchema>> {
        let items = value.as_array().ok_or_else(|| {
            RuntimeError::Validation("schema combinator must be an array".to_string())
        })?;
        items.iter().map(Self::compile).collect()
    }

    fn compile_object(
        object: &serde_json::Map<String, Value>,
    ) -> RuntimeResult<SchemaNode> {
        let mut properties = HashMap::new();
        if let Some(props) = object.get("properties").and_then(|v| v.as_object()) {
            for (name, subschema) in props {
                properties.insert(name.clone(), Self::compile(subschema)?);
            }
        }
        let required = object
            .get("required")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let additional = match object.get("additionalProperties") {
            None => AdditionalProperties::Allow,
            Some(Value::Bool(true)) => AdditionalProperties::Allow,
            Some(Value::Bool(false)) => AdditionalProperties::Deny,
            Some(schema) => AdditionalProperties::Schema(Box::new(Self::compile(schema)?)),
        };
        let mut dependencies = HashMap::new();
        if let Some(deps) = object.get("dependencies").and_then(|v| v.as_object()) {
            for (name, dependency) in deps {
                let compiled = match dependency {
                    Value::Array(keys) => Dependency::Keys(
                        keys.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect(),
                    ),
                    schema => Dependency::Schema(Box::new(Self::compile(schema)?)),
                };
                dependencies.insert(name.clone(), compiled);
            }
        }
        Ok(SchemaNode::Object {
            properties,
            required,
            additional,
            min_properties: object
                .get("minProperties")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
            max_properties: object
                .get("maxProperties")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
            dependencies,
        })
    }

    fn numeric_rules(object: &serde_json::Map<String, Value>) -> NumericRules {
        let mut rules = NumericRules {
            minimum: object.get("minimum").and_then(|v| v.as_f64()),
            maximum: object.get("maximum").and_then(|v| v.as_f64()),
            exclusive_minimum: object.get("exclusiveMinimum").and_then(|v| v.as_f64()),
            exclusive_maximum: object.get("exclusiveMaximum").and_then(|v| v.as_f64()),
            multiple_of: object.get("multipleOf").and_then(|v| v.as_f64()),
        };
        // OpenAPI 3.0 spells exclusivity as booleans modifying min/max.
        if object.get("exclusiveMinimum").and_then(|v| v.as_bool()) == Some(true) {
            rules.exclusive_minimum = rules.minimum.take();
        }
        if object.get("exclusiveMaximum").and_then(|v| v.as_bool()) == Some(true) {
            rules.exclusive_maximum = rules.maximum.take();
        }
        rules
    }

    pub fn validate(&self, value: &Value) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        self.check(value, "$", &mut issues);
        issues
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.validate(value).is_empty()
    }

    fn check(&self, value: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
        if let Some(expected) = &self.const_value {
            if value != expected {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!("value must equal const {expected}"),
                });
                return;
            }
        }
        if let Some(allowed) = &self.enumeration {
            if !allowed.contains(value) {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!(
                        "value {value} is not one of {}",
                        serde_json::to_string(allowed).unwrap_or_default()
                    ),
                });
                return;
            }
        }

        match &self.node {
            SchemaNode::Any | SchemaNode::Ref => {}
            SchemaNode::String {
                min_length,
                max_length,
                pattern,
                format,
            } => {
                let Some(text) = value.as_str() else {
                    issues.push(type_issue(path, "string", value));
                    return;
                };
                let length = text.chars().count();
                if let Some(min) = min_length {
                    if length < *min {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!("length {length} is below minLength {min}"),
                        });
                    }
                }
                if let Some(max) = max_length {
                    if length > *max {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!("length {length} exceeds maxLength {max}"),
                        });
                    }
                }
                if let Some(regex) = pattern {
                    if !regex.is_match(text) {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!("value does not match pattern {}", regex.as_str()),
                        });
                    }
                }
                if let Some(format) = format {
                    if !format.accepts(text) {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!("value is not a valid {}", format.name()),
                        });
                    }
                }
            }
            SchemaNode::Integer(rules) => {
                let is_integral = value
                    .as_f64()
                    .map(|n| n.fract() == 0.0)
                    .unwrap_or(false);
                if !value.is_number() || !is_integral {
                    issues.push(type_issue(path, "integer", value));
                    return;
                }
                self.check_numeric(value.as_f64().unwrap_or(0.0), rules, path, issues);
            }
            SchemaNode::Number(rules) => {
                let Some(number) = value.as_f64() else {
                    issues.push(type_issue(path, "number", value));
                    return;
                };
                self.check_numeric(number, rules, path, issues);
            }
            SchemaNode::Boolean => {
                if !value.is_boolean() {
                    issues.push(type_issue(path, "boolean", value));
                }
            }
            SchemaNode::Null => {
                if !value.is_null() {
                    issues.push(type_issue(path, "null", value));
                }
            }
            SchemaNode::Array {
                items,
                min_items,
                max_items,
                unique_items,
            } => {
                let Some(elements) = value.as_array() else {
                    issues.push(type_issue(path, "array", value));
                    return;
                };
                if let Some(min) = min_items {
                    if elements.len() < *min {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!("{} items is below minItems {min}", elements.len()),
                        });
                    }
                }
                if let Some(max) = max_items {
                    if elements.len() > *max {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!("{} items exceeds maxItems {max}", elements.len()),
                        });
                    }
                }
                if *unique_items {
                    for (i, left) in elements.iter().enumerate() {
                        if elements.iter().skip(i + 1).any(|right| right == left) {
                            issues.push(SchemaIssue {
                                path: path.to_string(),
                                message: "array items are not unique".to_string(),
                            });
                            break;
                        }
                    }
                }
                if let Some(item_schema) = items {
                    for (i, element) in elements.iter().enumerate() {
                        item_schema.check(element, &format!("{path}[{i}]"), issues);
                    }
                }
            }
            SchemaNode::Object {
                properties,
                required,
                additional,
                min_properties,
                max_properties,
                dependencies,
            } => {
                let Some(fields) = value.as_object() else {
                    issues.push(type_issue(path, "object", value));
                    return;
                };
                for name in required {
                    if !fields.contains_key(name) {
                        issues.push(SchemaIssue {
                            path: format!("{path}.{name}"),
                            message: "required property is missing".to_string(),
                        });
                    }
                }
                if let Some(min) = min_properties {
                    if fields.len() < *min {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!(
                                "{} properties is below minProperties {min}",
                                fields.len()
                            ),
                        });
                    }
                }
                if let Some(max) = max_properties {
                    if fields.len() > *max {
                        issues.push(SchemaIssue {
                            path: path.to_string(),
                            message: format!(
                                "{} properties exceeds maxProperties {max}",
                                fields.len()
                            ),
                        });
                    }
                }
                for (name, field_value) in fields {
                    let field_path = format!("{path}.{name}");
                    match properties.get(name) {
                        Some(subschema) => subschema.check(field_value, &field_path, issues),
                        None => match additional {
                            AdditionalProperties::Allow => {}
                            AdditionalProperties::Deny => issues.push(SchemaIssue {
                                path: field_path,
                                message: "additional property is not allowed".to_string(),
                            }),
                            AdditionalProperties::Schema(subschema) => {
                                subschema.check(field_value, &field_path, issues)
                            }
                        },
                    }
                }
                for (name, dependency) in dependencies {
                    if !fields.contains_key(name) {
                        continue;
                    }
                    match dependency {
                        Dependency::Keys(keys) => {
                            for key in keys {
                                if !fields.contains_key(key) {
                                    issues.push(SchemaIssue {
                                        path: format!("{path}.{key}"),
                                        message: format!(
                                            "property is required when '{name}' is present"
                                        ),
                                    });
                                }
                            }
                        }
                        Dependency::Schema(subschema) => subschema.check(value, path, issues),
                    }
                }
            }
            SchemaNode::OneOf(subschemas) => {
                let matching = subschemas
                    .iter()
                    .filter(|subschema| subschema.is_valid(value))
                    .count();
                if matching != 1 {
                    issues.push(SchemaIssue {
                        path: path.to_string(),
                        message: format!("value matches {matching} of the oneOf schemas"),
                    });
                }
            }
            SchemaNode::AnyOf(subschemas) => {
                if !subschemas.iter().any(|subschema| subschema.is_valid(value)) {
                    issues.push(SchemaIssue {
                        path: path.to_string(),
                        message: "value matches none of the anyOf schemas".to_string(),
                    });
                }
            }
            SchemaNode::AllOf(subschemas) => {
                for subschema in subschemas {
                    subschema.check(value, path, issues);
                }
            }
        }
    }

    fn check_numeric(
        &self,
        number: f64,
        rules: &NumericRules,
        path: &str,
        issues: &mut Vec<SchemaIssue>,
    ) {
        if let Some(minimum) = rules.minimum {
            if number < minimum {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!("{number} is below minimum {minimum}"),
                });
            }
        }
        if let Some(maximum) = rules.maximum {
            if number > maximum {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!("{number} exceeds maximum {maximum}"),
                });
            }
        }
        if let Some(bound) = rules.exclusive_minimum {
            if number <= bound {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!("{number} is not above exclusiveMinimum {bound}"),
                });
            }
        }
        if let Some(bound) = rules.exclusive_maximum {
            if number >= bound {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!("{number} is not below exclusiveMaximum {bound}"),
                });
            }
        }
        if let Some(step) = rules.multiple_of {
            if step != 0.0 {
                let quotient = number / step;
                if (quotient - quotient.round()).abs() > 1e-9 {
                    issues.push(SchemaIssue {
                        path: path.to_string(),
                        message: format!("{number} is not a multiple of {step}"),
                    });
                }
            }
        }
    }
}

fn type_issue(path: &str, expected: &str, value: &Value) -> SchemaIssue {
    let actual = match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    SchemaIssue {
        path: path.to_string(),
        message: format!("expected {expected}, got {actual}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_constraints() {
        let schema = CompiledSchema::compile(&json!({
            "type": "string",
            "minLength": 4,
            "pattern": "^[a-z]+$",
        }))
        .unwrap();
        assert!(schema.is_valid(&json!("secret")));
        assert!(!schema.is_valid(&json!("abc")));
        assert!(!schema.is_valid(&json!("ABCDEF")));
        assert!(!schema.is_valid(&json!(42)));
    }

    #[test]
    fn string_formats() {
        let uri = CompiledSchema::compile(&json!({"type": "string", "format": "uri"})).unwrap();
        assert!(uri.is_valid(&json!("postgres://localhost:5432/app")));
        assert!(!uri.is_valid(&json!("not a uri")));

        let ip = CompiledSchema::compile(&json!({"type": "string", "format": "ipv4"})).unwrap();
        assert!(ip.is_valid(&json!("10.0.0.1")));
        assert!(!ip.is_valid(&json!("300.0.0.1")));

        let stamp =
            CompiledSchema::compile(&json!({"type": "string", "format": "date-time"})).unwrap();
        assert!(stamp.is_valid(&json!("2024-03-01T10:30:00Z")));
        assert!(!stamp.is_valid(&json!("2024-03-01")));
    }

    #[test]
    fn numeric_bounds_and_multiples() {
        let schema = CompiledSchema::compile(&json!({
            "type": "integer",
            "minimum": 0,
            "exclusiveMaximum": 100,
            "multipleOf": 5,
        }))
        .unwrap();
        assert!(schema.is_valid(&json!(95)));
        assert!(!schema.is_valid(&json!(100)));
        assert!(!schema.is_valid(&json!(7)));
        assert!(!schema.is_valid(&json!(2.5)));
    }

    #[test]
    fn object_dependencies_both_forms() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {
                "card": {"type": "string"},
                "cvv": {"type": "string"},
            },
            "dependencies": {
                "card": ["cvv"],
            },
        }))
        .unwrap();
        assert!(schema.is_valid(&json!({"card": "1234", "cvv": "000"})));
        assert!(!schema.is_valid(&json!({"card": "1234"})));
        assert!(schema.is_valid(&json!({"cvv": "000"})));

        let schema_form = CompiledSchema::compile(&json!({
            "type": "object",
            "dependencies": {
                "card": {
                    "type": "object",
                    "required": ["billing"],
                },
            },
        }))
        .unwrap();
        assert!(!schema_form.is_valid(&json!({"card": "1234"})));
        assert!(schema_form.is_valid(&json!({"card": "1234", "billing": {}})));
    }

    #[test]
    fn additional_properties_schema_form() {
        let schema = CompiledSchema::compile(&json!({
            "type": "object",
            "properties": {"known": {"type": "string"}},
            "additionalProperties": {"type": "integer"},
        }))
        .unwrap();
        assert!(schema.is_valid(&json!({"known": "x", "extra": 3})));
        assert!(!schema.is_valid(&json!({"extra": "not an int"})));
    }

    #[test]
    fn combinators() {
        let schema = CompiledSchema::compile(&json!({
            "oneOf": [
                {"type": "string"},
                {"type": "integer"},
            ],
        }))
        .unwrap();
        assert!(schema.is_valid(&json!("text")));
        assert!(schema.is_valid(&json!(3)));
        assert!(!schema.is_valid(&json!(true)));

        let all = CompiledSchema::compile(&json!({
            "allOf": [
                {"type": "object", "required": ["a"]},
                {"type": "object", "required": ["b"]},
            ],
        }))
        .unwrap();
        assert!(all.is_valid(&json!({"a": 1, "b": 2})));
        assert!(!all.is_valid(&json!({"a": 1})));
    }

    #[test]
    fn ref_is_opaque() {
        let schema = CompiledSchema::compile(&json!({"$ref": "#/definitions/other"})).unwrap();
        assert!(schema.is_valid(&json!({"anything": true})));
        assert!(schema.is_valid(&json!("scalar")));
    }

    #[test]
    fn unique_items() {
        let schema = CompiledSchema::compile(&json!({
            "type": "array",
            "items": {"type": "integer"},
            "uniqueItems": true,
        }))
        .unwrap();
        assert!(schema.is_valid(&json!([1, 2, 3])));
        assert!(!schema.is_valid(&json!([1, 2, 1])));
    }
}
