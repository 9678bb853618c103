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

use super::{StepTarget, WorkflowStep, END_TARGET};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::resources::WorkflowSpec;
use std::collections::{HashMap, HashSet};

/// Static validation run before any step executes: the initial step and
/// every `next`/`transitions` target must exist, and the pure `next`
/// edges must be acyclic. `END` is exempt everywhere.
pub fn validate(spec: &WorkflowSpec) -> RuntimeResult<()> {
    let ids: HashSet<&str> = spec.steps.iter().map(|step| step.id.as_str()).collect();
    if ids.len() != spec.steps.len() {
        return Err(RuntimeError::Validation(
            "workflow steps must have unique ids".to_string(),
        ));
    }
    if !ids.contains(spec.initial_step.as_str()) {
        return Err(RuntimeError::Validation(format!(
            "initialStep '{}' does not reference a step",
            spec.initial_step
        )));
    }

    for step in &spec.steps {
        for target in next_targets(step) {
            if target != END_TARGET && !ids.contains(target) {
                return Err(RuntimeError::Validation(format!(
                    "step '{}' points at unknown step '{}'",
                    step.id, target
                )));
            }
        }
        if let Some(transitions) = &step.transitions {
            for target in transitions.values() {
                if target != END_TARGET && !ids.contains(target.as_str()) {
                    return Err(RuntimeError::Validation(format!(
                        "step '{}' transition points at unknown step '{}'",
                        step.id, target
                    )));
                }
            }
        }
    }

    detect_next_cycles(&spec.steps)
}

fn next_targets(step: &WorkflowStep) -> Vec<&str> {
    match &step.next {
        Some(StepTarget::Step(id)) => vec![id.as_str()],
        Some(StepTarget::Many(ids)) => ids.iter().map(String::as_str).collect(),
        Some(StepTarget::End) | None => Vec::new(),
    }
}

/// Depth-first walk over the pure `next` edges; a back edge is a simple
/// cycle the executor could never leave. Transition edges stay out of
/// this check since they branch on runtime outcomes.
fn detect_next_cycles(steps: &[WorkflowStep]) -> RuntimeResult<()> {
    let edges: HashMap<&str, Vec<&str>> = steps
        .iter()
        .map(|step| (step.id.as_str(), next_targets(step)))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for start in edges.keys() {
        if marks.contains_key(start) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::Visiting);
        while let Some((node, child_index)) = stack.pop() {
            let children = edges.get(node).cloned().unwrap_or_default();
            if child_index < children.len() {
                stack.push((node, child_index + 1));
                let child = children[child_index];
                if child == END_TARGET {
                    continue;
                }
                match marks.get(child) {
                    Some(Mark::Visiting) => {
                        return Err(RuntimeError::CyclicDependency(format!(
                            "steps '{node}' and '{child}' form a next-chain cycle"
                        )));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::Visiting);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepAction;

    fn step(id: &str, next: Option<StepTarget>) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: None,
            action: StepAction::Function {
                function: "noop".to_string(),
            },
            input: None,
            output: None,
            next,
            timeout: None,
            retries: None,
            retry_delay_ms: None,
            transitions: None,
        }
    }

    fn spec(initial: &str, steps: Vec<WorkflowStep>) -> WorkflowSpec {
        WorkflowSpec {
            initial_step: initial.to_string(),
            steps,
        }
    }

    #[test]
    fn missing_initial_step_is_rejected() {
        let spec = spec("ghost", vec![step("a", None)]);
        let error = validate(&spec).unwrap_err();
        assert_eq!(error.name(), "ValidationError");
    }

    #[test]
    fn unknown_next_target_is_rejected() {
        let spec = spec(
            "a",
            vec![step("a", Some(StepTarget::Step("missing".into())))],
        );
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn next_cycle_is_rejected() {
        let spec = spec(
            "a",
            vec![
                step("a", Some(StepTarget::Step("b".into()))),
                step("b", Some(StepTarget::Step("a".into()))),
            ],
        );
        let error = validate(&spec).unwrap_err();
        assert_eq!(error.name(), "CyclicDependencyError");
    }

    #[test]
    fn self_loop_is_rejected() {
        let spec = spec("a", vec![step("a", Some(StepTarget::Step("a".into())))]);
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn end_sentinel_and_transition_loops_are_allowed() {
        let mut retry = step("check", Some(StepTarget::End));
        retry.transitions = Some(
            [("false".to_string(), "work".to_string())]
                .into_iter()
                .collect(),
        );
        let spec = spec(
            "work",
            vec![step("work", Some(StepTarget::Step("check".into()))), retry],
        );
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn diamond_over_next_arrays_is_acyclic() {
        let spec = spec(
            "a",
            vec![
                step(
                    "a",
                    Some(StepTarget::Many(vec!["b".into(), "c".into()])),
                ),
                step("b", Some(StepTarget::Step("d".into()))),
                step("c", Some(StepTarget::Step("d".into()))),
                step("d", None),
            ],
        );
        assert!(validate(&spec).is_ok());
    }
}
