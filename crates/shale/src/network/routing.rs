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

use super::state::NetworkState;
use super::{AgentPerformance, NetworkAgent, TraceRecord};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::resources::RoutingKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub type CustomRouteHandler = Arc<
    dyn Fn(&str, &[NetworkAgent], &NetworkState, &[TraceRecord]) -> Option<String> + Send + Sync,
>;

#[derive(Clone)]
pub enum RoutingStrategy {
    /// The router model chooses freely through its toolset.
    Default,
    RoundRobin,
    HistoryBased,
    SemanticMatching,
    Custom(CustomRouteHandler),
}

impl From<RoutingKind> for RoutingStrategy {
    fn from(kind: RoutingKind) -> Self {
        match kind {
            RoutingKind::Default => RoutingStrategy::Default,
            RoutingKind::RoundRobin => RoutingStrategy::RoundRobin,
            RoutingKind::HistoryBased => RoutingStrategy::HistoryBased,
            RoutingKind::SemanticMatching => RoutingStrategy::SemanticMatching,
            // A custom strategy needs its handler installed at runtime;
            // until then the router model drives.
            RoutingKind::Custom => RoutingStrategy::Default,
        }
    }
}

/// Strategy dispatcher shared by `routeTo` and direct executions. The
/// round-robin cursor survives across calls.
pub struct Router {
    strategy: RoutingStrategy,
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> &RoutingStrategy {
        &self.strategy
    }

    pub fn select(
        &self,
        input: &str,
        agents: &[NetworkAgent],
        performance: &HashMap<String, AgentPerformance>,
        state: &NetworkState,
        history: &[TraceRecord],
    ) -> RuntimeResult<String> {
        if agents.is_empty() {
            return Err(RuntimeError::NotFound(
                "network has no agents to route to".to_string(),
            ));
        }
        match &self.strategy {
            // The router model normally picks for DEFAULT; `routeTo`
            // issued under it falls back to rotation.
            RoutingStrategy::Default | RoutingStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % agents.len();
                Ok(agents[index].name.clone())
            }
            RoutingStrategy::HistoryBased => Ok(history_based(agents, performance)),
            RoutingStrategy::SemanticMatching => Ok(semantic_matching(input, agents, performance)),
            RoutingStrategy::Custom(handler) => {
                let choice = handler(input, agents, state, history).ok_or_else(|| {
                    RuntimeError::Execution("custom route handler returned no agent".to_string())
                })?;
                if !agents.iter().any(|agent| agent.name == choice) {
                    return Err(RuntimeError::NotFound(format!(
                        "custom route handler chose unknown agent '{choice}'"
                    )));
                }
                Ok(choice)
            }
        }
    }
}

/// `0.7 * success_rate + 0.3 * (1000 / avg_latency)`; agents without any
/// prior call are ineligible unless every agent is fresh. Ties resolve to
/// declaration order.
fn history_based(
    agents: &[NetworkAgent],
    performance: &HashMap<String, AgentPerformance>,
) -> String {
    let seasoned: Vec<&NetworkAgent> = agents
        .iter()
        .filter(|agent| {
            performance
                .get(&agent.name)
                .map(|perf| perf.calls > 0)
                .unwrap_or(false)
        })
        .collect();
    let pool: Vec<&NetworkAgent> = if seasoned.is_empty() {
        agents.iter().collect()
    } else {
        seasoned
    };

    let mut best = pool[0];
    let mut best_score = f64::MIN;
    for agent in pool {
        let perf = performance.get(&agent.name).cloned().unwrap_or_default();
        let latency = perf.avg_latency_ms().max(1.0);
        let score = 0.7 * perf.success_rate() + 0.3 * (1000.0 / latency);
        if score > best_score {
            best_score = score;
            best = agent;
        }
    }
    best.name.clone()
}

const TOKEN_BREAKS: &[char] = &[
    ',', '.', '?', '!', ';', ':', '(', ')', '[', ']', '"', '\'', '，', '。', '？', '！', '、',
    '；', '：', '（', '）', '“', '”', '‘', '’', '《', '》',
];

/// Whitespace plus common Latin/CJK punctuation; tokens of two or fewer
/// characters are noise.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || TOKEN_BREAKS.contains(&c))
        .filter(|token| token.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

const FINANCE_HINTS: &[&str] = &[
    "账单", "收费", "费用", "退款", "发票", "扣款", "billing", "charge", "refund", "invoice",
    "payment",
];
const CUSTOMER_HINTS: &[&str] = &[
    "投诉", "客服", "咨询", "帮助", "complaint", "support", "help", "customer",
];
const TECHNICAL_HINTS: &[&str] = &[
    "错误", "故障", "崩溃", "bug", "error", "crash", "technical", "debug",
];

fn role_boost(input: &str, agent: &NetworkAgent) -> f64 {
    let role = agent
        .role
        .clone()
        .unwrap_or_default()
        .to_lowercase();
    let name = agent.name.to_lowercase();
    let mentions = |hints: &[&str]| hints.iter().any(|hint| input.contains(hint));

    let mut boost = 0.0;
    if mentions(FINANCE_HINTS) && (role.contains("财务") || role.contains("financ") || name.contains("financ")) {
        boost += 3.0;
    }
    if mentions(CUSTOMER_HINTS) && (role.contains("客服") || role.contains("customer") || name.contains("customer")) {
        boost += 3.0;
    }
    if mentions(TECHNICAL_HINTS) && (role.contains("技术") || role.contains("technic") || name.contains("technic")) {
        boost += 3.0;
    }
    boost
}

/// Token overlap (exact = 2, partial = 1) plus role boosts, scaled by
/// `0.5 + 0.5 * success_rate`.
fn semantic_matching(
    input: &str,
    agents: &[NetworkAgent],
    performance: &HashMap<String, AgentPerformance>,
) -> String {
    let input_lower = input.to_lowercase();
    let input_tokens = tokenize(input);

    let mut best = &agents[0];
    let mut best_score = f64::MIN;
    for agent in agents {
        let agent_tokens = tokenize(&agent.matching_text());
        let mut score = 0.0;
        for input_token in &input_tokens {
            for agent_token in &agent_tokens {
                if input_token == agent_token {
                    score += 2.0;
                } else if input_token.contains(agent_token.as_str())
                    || agent_token.contains(input_token.as_str())
                {
                    score += 1.0;
                }
            }
        }
        score += role_boost(&input_lower, agent);

        let success_rate = performance
            .get(&agent.name)
            .map(AgentPerformance::success_rate)
            .unwrap_or(1.0);
        score *= 0.5 + 0.5 * success_rate;

        if score > best_score {
            best_score = score;
            best = agent;
        }
    }
    best.name.clone()
}
