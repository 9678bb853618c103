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

use crate::resources::ResourceKey;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{env\.([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replaces every `${env.NAME}` with the named environment variable, or
/// the empty string when unset. Plain `${NAME}` references are left
/// intact.
pub fn substitute_env(text: &str) -> String {
    ENV_REF
        .replace_all(text, |captures: &regex::Captures<'_>| {
            std::env::var(&captures[1]).unwrap_or_default()
        })
        .into_owned()
}

/// `when` truthiness: absent values load, the empty string, `"false"`
/// and `"0"` do not.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !(text.is_empty() || text == "false" || text == "0"),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Shell-style matching for directory entries: `*` spans any run of
/// characters, `?` exactly one.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map(|compiled| compiled.is_match(name))
        .unwrap_or(false)
}

/// Outcome of applying a pod document.
#[derive(Debug, Default, Clone)]
pub struct PodApplyReport {
    pub applied: Vec<ResourceKey>,
    pub skipped: usize,
}

impl PodApplyReport {
    pub fn merge(&mut self, other: PodApplyReport) {
        self.applied.extend(other.applied);
        self.skipped += other.skipped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn env_substitution_only_touches_env_prefixed_refs() {
        std::env::set_var("SHALE_POD_TEST_KEY", "sk-123");
        let text = "apiKey: ${env.SHALE_POD_TEST_KEY} other: ${PLAIN} missing: ${env.SHALE_POD_UNSET_XYZ}";
        assert_eq!(
            substitute_env(text),
            "apiKey: sk-123 other: ${PLAIN} missing: "
        );
    }

    #[test]
    fn when_truthiness() {
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!("0")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&Value::Null));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(true)));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("*.yaml", "agents.yaml"));
        assert!(!glob_match("*.yaml", "agents.yml"));
        assert!(glob_match("agent-?.yaml", "agent-1.yaml"));
        assert!(!glob_match("agent-?.yaml", "agent-12.yaml"));
        assert!(glob_match("*", "anything.at.all"));
    }
}
