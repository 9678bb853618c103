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

use super::{QueuedTask, RunningCounters, SchedulerConfig};
use std::cmp::Reverse;

/// Priority queue ordered by (priority DESC, submitted_at ASC, sequence
/// ASC). Kept sorted on insert so eligibility scans walk best-first.
#[derive(Default)]
pub struct TaskQueue {
    items: Vec<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, task: QueuedTask) {
        let key = (Reverse(task.priority), task.submitted_at, task.seq);
        let index = self
            .items
            .iter()
            .position(|queued| (Reverse(queued.priority), queued.submitted_at, queued.seq) > key)
            .unwrap_or(self.items.len());
        self.items.insert(index, task);
    }

    /// Pops the highest-priority task whose kind and group limits still
    /// have headroom under the given counters.
    pub fn pop_eligible(
        &mut self,
        running: &RunningCounters,
        config: &SchedulerConfig,
    ) -> Option<QueuedTask> {
        let index = self.items.iter().position(|task| {
            let kind_ok = config
                .resource_type_limits
                .get(&task.kind)
                .map(|limit| running.count_for_kind(&task.kind) < *limit)
                .unwrap_or(true);
            let group_ok = task
                .group_key
                .as_ref()
                .and_then(|group| {
                    config
                        .group_limits
                        .get(group)
                        .map(|limit| running.count_for_group(group) < *limit)
                })
                .unwrap_or(true);
            kind_ok && group_ok
        })?;
        Some(self.items.remove(index))
    }

    pub fn remove_by_id(&mut self, task_id: &str) -> Option<QueuedTask> {
        let index = self.items.iter().position(|task| task.id == task_id)?;
        Some(self.items.remove(index))
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.items.iter().map(|task| task.id.clone()).collect()
    }
}
