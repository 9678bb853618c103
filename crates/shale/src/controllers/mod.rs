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

pub mod agent;
pub mod crd;
pub mod llm;
pub mod network;
pub mod tool;
pub mod workflow;

pub use agent::AgentController;
pub use crd::CrdController;
pub use llm::LlmController;
pub use network::NetworkController;
pub use tool::ToolController;
pub use workflow::WorkflowController;

use crate::reconcile::{Controller, Reconciler, ReconcilerConfig};
use crate::resources::ResourceKind;
use crate::runtime::RuntimeContext;
use std::collections::HashMap;
use std::sync::Arc;

/// One reconciler per built-in kind, all driving the shared framework.
pub fn build_reconcilers(
    ctx: &Arc<RuntimeContext>,
    config: ReconcilerConfig,
) -> HashMap<ResourceKind, Reconciler> {
    let controllers: Vec<Arc<dyn Controller>> = vec![
        Arc::new(AgentController::new(ctx.clone())),
        Arc::new(ToolController::new(ctx.clone())),
        Arc::new(WorkflowController::new(ctx.clone())),
        Arc::new(NetworkController::new(ctx.clone())),
        Arc::new(LlmController::new(ctx.clone())),
        Arc::new(CrdController::new(ctx.clone())),
    ];

    controllers
        .into_iter()
        .map(|controller| {
            let kind = controller.kind();
            let reconciler = Reconciler::new(
                controller,
                ctx.store.clone(),
                ctx.bus.clone(),
                config.clone(),
            );
            (kind, reconciler)
        })
        .collect()
}
