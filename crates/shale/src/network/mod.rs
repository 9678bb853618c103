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
pub mod routing;
pub mod state;

pub use executor::{NetworkExecutor, NetworkOptions, NetworkRunSummary};
pub use routing::{Router, RoutingStrategy};
pub use state::{NetworkState, NetworkStateStore, StateChange};

use crate::agents::AgentHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One member of a network's worker pool, resolved at reconcile time.
#[derive(Clone)]
pub struct NetworkAgent {
    pub name: String,
    pub role: Option<String>,
    pub specialties: Option<String>,
    pub description: Option<String>,
    pub handle: Arc<AgentHandle>,
}

impl NetworkAgent {
    /// The text the semantic strategy matches against.
    pub fn matching_text(&self) -> String {
        self.specialties
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| format!("generic agent {}", self.name))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPerformance {
    pub calls: u64,
    pub successes: u64,
    pub total_latency_ms: u64,
}

impl AgentPerformance {
    pub fn record(&mut self, success: bool, latency_ms: u64) {
        self.calls += 1;
        if success {
            self.successes += 1;
        }
        self.total_latency_ms += latency_ms;
    }

    /// Optimistic before any call has been made.
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls as f64
        }
    }
}

/// Record of a single router or worker invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: String,
    pub step: u32,
    pub agent_id: String,
    pub input: String,
    pub output: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub latency: u64,
    pub is_router_call: bool,
    /// Shallow state diff taken around the invocation; deleted keys map
    /// to `null`.
    pub state_changes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub total_calls: u64,
    pub router_calls: u64,
    pub agent_calls: u64,
    pub calls_by_agent: HashMap<String, u64>,
    pub total_latency: u64,
    pub average_latency: f64,
    pub max_latency: u64,
    pub total_steps: u32,
}

impl TraceSummary {
    pub fn from_traces(traces: &[TraceRecord], total_steps: u32) -> Self {
        let mut summary = TraceSummary {
            total_steps,
            ..Default::default()
        };
        for trace in traces {
            summary.total_calls += 1;
            if trace.is_router_call {
                summary.router_calls += 1;
            } else {
                summary.agent_calls += 1;
                *summary
                    .calls_by_agent
                    .entry(trace.agent_id.clone())
                    .or_insert(0) += 1;
            }
            summary.total_latency += trace.latency;
            summary.max_latency = summary.max_latency.max(trace.latency);
        }
        if summary.total_calls > 0 {
            summary.average_latency = summary.total_latency as f64 / summary.total_calls as f64;
        }
        summary
    }
}

/// Execution surface written back onto the Network resource status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_summary: Option<TraceSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_aggregates_router_and_worker_calls() {
        let base = Utc::now();
        let trace = |agent: &str, router: bool, latency: u64| TraceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            step: 0,
            agent_id: agent.to_string(),
            input: String::new(),
            output: String::new(),
            start_time: base,
            end_time: base,
            latency,
            is_router_call: router,
            state_changes: HashMap::new(),
        };
        let traces = vec![
            trace("router", true, 10),
            trace("a", false, 30),
            trace("a", false, 50),
            trace("b", false, 20),
        ];
        let summary = TraceSummary::from_traces(&traces, 3);
        assert_eq!(summary.total_calls, 4);
        assert_eq!(summary.router_calls, 1);
        assert_eq!(summary.agent_calls, 3);
        assert_eq!(summary.calls_by_agent["a"], 2);
        assert_eq!(summary.total_latency, 110);
        assert_eq!(summary.max_latency, 50);
        assert_eq!(summary.average_latency, 27.5);
        assert_eq!(summary.total_steps, 3);
    }

    #[test]
    fn performance_rates() {
        let mut perf = AgentPerformance::default();
        assert_eq!(perf.success_rate(), 1.0);
        perf.record(true, 100);
        perf.record(false, 300);
        assert_eq!(perf.success_rate(), 0.5);
        assert_eq!(perf.avg_latency_ms(), 200.0);
    }
}
