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

pub(crate) mod queue;

pub(crate) use queue::TaskQueue;

use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::EventBus;
use crate::resources::ResourceKind;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync>;

/// A unit of work bound for the scheduler. Immutable once submitted
/// except for the attempt counter.
pub struct TaskRequest {
    pub id: Option<String>,
    pub priority: TaskPriority,
    pub resource: String,
    pub kind: ResourceKind,
    pub handler: TaskHandler,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Overrides the scheduler's backoff base for this task.
    pub retry_delay_ms: Option<u64>,
    pub group_key: Option<String>,
}

impl TaskRequest {
    pub fn new<F>(kind: ResourceKind, resource: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, RuntimeResult<Value>> + Send + Sync + 'static,
    {
        Self {
            id: None,
            priority: TaskPriority::Normal,
            resource: resource.into(),
            kind,
            handler: Arc::new(handler),
            timeout_ms: 30_000,
            max_retries: 0,
            retry_delay_ms: None,
            group_key: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(retry_delay_ms);
        self
    }

    pub fn with_group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<RuntimeError>,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Future side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: String,
    receiver: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub async fn wait(self) -> RuntimeResult<TaskResult> {
        self.receiver
            .await
            .map_err(|_| RuntimeError::Scheduler("task result channel dropped".to_string()))
    }
}

pub(crate) struct QueuedTask {
    pub id: String,
    pub priority: TaskPriority,
    pub resource: String,
    pub kind: ResourceKind,
    pub handler: TaskHandler,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: Option<u64>,
    pub attempts: u32,
    pub group_key: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub seq: u64,
    pub responder: oneshot::Sender<TaskResult>,
}

impl QueuedTask {
    pub(crate) fn from_request(request: TaskRequest, seq: u64) -> (Self, TaskHandle) {
        let id = request
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (sender, receiver) = oneshot::channel();
        let task = Self {
            id: id.clone(),
            priority: request.priority,
            resource: request.resource,
            kind: request.kind,
            handler: request.handler,
            timeout_ms: request.timeout_ms,
            max_retries: request.max_retries,
            retry_delay_ms: request.retry_delay_ms,
            attempts: 0,
            group_key: request.group_key,
            submitted_at: Utc::now(),
            seq,
            responder: sender,
        };
        let handle = TaskHandle {
            task_id: id,
            receiver,
        };
        (task, handle)
    }

    fn result(&self, status: TaskStatus, output: Option<Value>, error: Option<RuntimeError>) -> TaskResult {
        TaskResult {
            task_id: self.id.clone(),
            status,
            output,
            error,
            attempts: self.attempts,
            submitted_at: self.submitted_at,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    pub max_queue_length: usize,
    pub idle_tick_ms: u64,
    pub retry_enabled: bool,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub resource_type_limits: HashMap<ResourceKind, usize>,
    pub group_limits: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_queue_length: 1000,
            idle_tick_ms: 1000,
            retry_enabled: true,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            resource_type_limits: HashMap::new(),
            group_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunningCounters {
    total: usize,
    by_kind: HashMap<ResourceKind, usize>,
    by_group: HashMap<String, usize>,
}

impl RunningCounters {
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn count_for_kind(&self, kind: &ResourceKind) -> usize {
        self.by_kind.get(kind).copied().unwrap_or(0)
    }

    pub fn count_for_group(&self, group: &str) -> usize {
        self.by_group.get(group).copied().unwrap_or(0)
    }

    pub(crate) fn increment(&mut self, task: &QueuedTask) {
        self.total += 1;
        *self.by_kind.entry(task.kind.clone()).or_insert(0) += 1;
        if let Some(group) = &task.group_key {
            *self.by_group.entry(group.clone()).or_insert(0) += 1;
        }
    }

    pub(crate) fn decrement(&mut self, task: &QueuedTask) {
        self.total = self.total.saturating_sub(1);
        if let Some(count) = self.by_kind.get_mut(&task.kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.by_kind.remove(&task.kind);
            }
        }
        if let Some(group) = &task.group_key {
            if let Some(count) = self.by_group.get_mut(group) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.by_group.remove(group);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub queued: usize,
    pub running: usize,
    pub running_by_kind: HashMap<String, usize>,
    pub running_by_group: HashMap<String, usize>,
    pub submitted_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    pub cancelled_total: u64,
}

struct SchedulerState {
    queue: TaskQueue,
    running: RunningCounters,
    next_seq: u64,
}

struct SchedulerInner {
    config: RwLock<SchedulerConfig>,
    state: Mutex<SchedulerState>,
    bus: EventBus,
    wake: Notify,
    active: AtomicBool,
    submitted_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    retried_total: AtomicU64,
    cancelled_total: AtomicU64,
}

/// Global priority task queue with per-type and per-group concurrency
/// limits. Failures never escape to the caller as panics; every outcome
/// is encoded in the task's `TaskResult`.
#[derive(Clone)]
pub struct ResourceScheduler {
    inner: Arc<SchedulerInner>,
}

impl ResourceScheduler {
    pub fn new(config: SchedulerConfig, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config: RwLock::new(config),
                state: Mutex::new(SchedulerState {
                    queue: TaskQueue::new(),
                    running: RunningCounters::default(),
                    next_seq: 0,
                }),
                bus,
                wake: Notify::new(),
                active: AtomicBool::new(false),
                submitted_total: AtomicU64::new(0),
                completed_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
                retried_total: AtomicU64::new(0),
                cancelled_total: AtomicU64::new(0),
            }),
        }
    }

    /// Starts the dispatch loop. Idempotent; a stopped scheduler resumes
    /// with its queue intact.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.bus.publish("scheduler.started", json!({}));
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                SchedulerInner::dispatch_ready(&inner).await;
                let idle_tick_ms = { inner.config.read().await.idle_tick_ms };
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(idle_tick_ms)) => {}
                }
            }
        });
    }

    /// Halts dispatch. In-flight work completes; queued tasks stay
    /// queued for the next `start()`.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.wake.notify_one();
        self.inner.bus.publish("scheduler.stopped", json!({}));
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn submit(&self, request: TaskRequest) -> RuntimeResult<TaskHandle> {
        let max_queue_length = { self.inner.config.read().await.max_queue_length };
        let (task_meta, handle) = {
            let mut state = self.inner.state.lock().await;
            if state.queue.len() >= max_queue_length {
                return Err(RuntimeError::Scheduler(format!(
                    "queue is full ({max_queue_length})"
                )));
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            let (task, handle) = QueuedTask::from_request(request, seq);
            let meta = json!({
                "taskId": task.id,
                "resource": task.resource,
                "kind": task.kind.as_str(),
                "priority": task.priority,
                "groupKey": task.group_key,
            });
            state.queue.push(task);
            (meta, handle)
        };
        self.inner.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.inner.bus.publish("scheduler.task.submitted", task_meta);
        self.inner.wake.notify_one();
        Ok(handle)
    }

    /// Removes a queued task, resolving its future as cancelled. Running
    /// tasks are not interrupted; `Ok(false)` is returned for them.
    pub async fn cancel(&self, task_id: &str) -> RuntimeResult<bool> {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.queue.remove_by_id(task_id)
        };
        match removed {
            Some(task) => {
                let result = task.result(TaskStatus::Cancelled, None, None);
                let responder = task.responder;
                let _ = responder.send(result);
                self.inner.cancelled_total.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .bus
                    .publish("scheduler.task.cancelled", json!({ "taskId": task_id }));
                self.inner.wake.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn update_config<F>(&self, mutate: F)
    where
        F: FnOnce(&mut SchedulerConfig),
    {
        {
            let mut config = self.inner.config.write().await;
            mutate(&mut config);
        }
        self.inner.bus.publish("scheduler.config.updated", json!({}));
        self.inner.wake.notify_one();
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.inner.state.lock().await;
        SchedulerSnapshot {
            queued: state.queue.len(),
            running: state.running.total(),
            running_by_kind: state
                .running
                .by_kind
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            running_by_group: state.running.by_group.clone(),
            submitted_total: self.inner.submitted_total.load(Ordering::Relaxed),
            completed_total: self.inner.completed_total.load(Ordering::Relaxed),
            failed_total: self.inner.failed_total.load(Ordering::Relaxed),
            retried_total: self.inner.retried_total.load(Ordering::Relaxed),
            cancelled_total: self.inner.cancelled_total.load(Ordering::Relaxed),
        }
    }
}

impl SchedulerInner {
    async fn dispatch_ready(inner: &Arc<Self>) {
        loop {
            let config = { inner.config.read().await.clone() };
            let task = {
                let mut guard = inner.state.lock().await;
                let state = &mut *guard;
                if state.running.total() >= config.max_concurrent_tasks {
                    None
                } else {
                    let task = state.queue.pop_eligible(&state.running, &config);
                    if let Some(task) = task {
                        state.running.increment(&task);
                        Some(task)
                    } else {
                        None
                    }
                }
            };
            match task {
                Some(task) => {
                    let worker_inner = inner.clone();
                    tokio::spawn(async move {
                        SchedulerInner::run_task(worker_inner, task).await;
                    });
                }
                None => break,
            }
        }
    }

    async fn run_task(inner: Arc<Self>, mut task: QueuedTask) {
        task.attempts += 1;
        inner.bus.publish(
            "scheduler.task.started",
            json!({ "taskId": task.id, "attempt": task.attempts }),
        );

        let outcome: RuntimeResult<Value> = if task.timeout_ms == 0 {
            Err(RuntimeError::Timeout(format!(
                "task {} exceeded its 0ms deadline",
                task.id
            )))
        } else {
            // The handler runs in its own task: on deadline expiry the
            // work keeps going, only its result is discarded.
            let work = tokio::spawn((task.handler)());
            match tokio::time::timeout(Duration::from_millis(task.timeout_ms), work).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(RuntimeError::Internal(format!(
                    "task handler aborted: {join_error}"
                ))),
                Err(_) => Err(RuntimeError::Timeout(format!(
                    "task {} exceeded its {}ms deadline",
                    task.id, task.timeout_ms
                ))),
            }
        };

        {
            let mut state = inner.state.lock().await;
            state.running.decrement(&task);
        }

        let config = { inner.config.read().await.clone() };
        match outcome {
            Ok(output) => {
                inner.completed_total.fetch_add(1, Ordering::Relaxed);
                inner.bus.publish(
                    "scheduler.task.completed",
                    json!({ "taskId": task.id, "attempts": task.attempts }),
                );
                let result = task.result(TaskStatus::Completed, Some(output), None);
                let _ = task.responder.send(result);
            }
            Err(error) => {
                let may_retry = config.retry_enabled
                    && error.is_retryable()
                    && task.attempts <= task.max_retries;
                if may_retry {
                    let base_ms = task.retry_delay_ms.unwrap_or(config.retry_base_ms);
                    let delay_ms =
                        retry_delay_ms(task.attempts, base_ms, config.retry_max_ms);
                    inner.retried_total.fetch_add(1, Ordering::Relaxed);
                    inner.bus.publish(
                        "scheduler.task.retry",
                        json!({
                            "taskId": task.id,
                            "attempt": task.attempts,
                            "delayMs": delay_ms,
                            "error": error.to_string(),
                        }),
                    );
                    let retry_inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        {
                            let mut state = retry_inner.state.lock().await;
                            state.queue.push(task);
                        }
                        retry_inner.wake.notify_one();
                    });
                } else {
                    inner.failed_total.fetch_add(1, Ordering::Relaxed);
                    inner.bus.publish(
                        "scheduler.task.failed",
                        json!({
                            "taskId": task.id,
                            "attempts": task.attempts,
                            "error": error.to_string(),
                            "errorName": error.name(),
                        }),
                    );
                    let result = task.result(TaskStatus::Failed, None, Some(error));
                    let _ = task.responder.send(result);
                }
            }
        }
        inner.wake.notify_one();
    }
}

/// Capped exponential backoff: `min(base * 2^(attempts-1) + jitter, max)`
/// with jitter drawn uniformly from `[0, 0.25 * exponential]`.
pub fn retry_delay_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempts.saturating_sub(1).min(16);
    let exponential = base_ms.saturating_mul(1u64 << exponent);
    let jitter_bound = exponential / 4;
    let jitter = if jitter_bound == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_bound)
    };
    exponential.saturating_add(jitter).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_are_non_decreasing_up_to_the_cap() {
        for _ in 0..32 {
            let first = retry_delay_ms(1, 1000, 30_000);
            let second = retry_delay_ms(2, 1000, 30_000);
            let sixth = retry_delay_ms(6, 1000, 30_000);
            assert!((1000..=1250).contains(&first));
            assert!((2000..=2500).contains(&second));
            assert_eq!(sixth, 30_000);
        }
    }

    #[test]
    fn priority_order_is_low_to_critical() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }
}
