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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const LOGGER_TOPIC: &str = "logger.log";

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Handler error: {0}")]
    Handler(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Delivery is synchronous on the publisher's thread; handlers must not
/// block on the bus itself.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &BusEvent) -> Result<(), EventError>;
}

impl<F> EventHandler for F
where
    F: Fn(&BusEvent) -> Result<(), EventError> + Send + Sync,
{
    fn handle(&self, event: &BusEvent) -> Result<(), EventError> {
        self(event)
    }
}

struct Subscriber {
    id: u64,
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// N:M topic broker. Each subscriber sees each matching publication once;
/// a failing subscriber is logged and its peers still run.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let pattern = pattern.into();
        {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.push(Subscriber {
                id,
                pattern,
                handler,
            });
        }
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscribe_fn<F>(&self, pattern: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            pattern,
            Arc::new(move |event: &BusEvent| -> Result<(), EventError> {
                handler(event);
                Ok(())
            }),
        )
    }

    pub fn publish(&self, topic: impl Into<String>, payload: Value) {
        let event = BusEvent::new(topic, payload);
        self.deliver(&event);

        if event.topic != LOGGER_TOPIC {
            let mirrored = BusEvent::new(
                LOGGER_TOPIC,
                json!({ "topic": event.topic, "payload": event.payload }),
            );
            self.deliver(&mirrored);
        }
    }

    fn deliver(&self, event: &BusEvent) {
        let matched: Vec<(u64, Arc<dyn EventHandler>)> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers
                .iter()
                .filter(|subscriber| pattern_matches(&subscriber.pattern, &event.topic))
                .map(|subscriber| (subscriber.id, subscriber.handler.clone()))
                .collect()
        };

        for (id, handler) in matched {
            if let Err(error) = handler.handle(event) {
                log::warn!(
                    "event subscriber {} failed on topic {}: {}",
                    id,
                    event.topic,
                    error
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe;
/// `unsubscribe` may be called any number of times.
pub struct Subscription {
    id: u64,
    inner: std::sync::Weak<BusInner>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            let mut subscribers = inner
                .subscribers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.retain(|subscriber| subscriber.id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Dotted-segment topic matching. A leading `*.` is a suffix match, a
/// trailing `.*` a prefix match, an interior `*` matches exactly one
/// segment.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic || pattern == "*" {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return topic.ends_with(&format!(".{suffix}")) || topic == suffix;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic.starts_with(&format!("{prefix}.")) || topic == prefix;
    }

    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let topic_segments: Vec<&str> = topic.split('.').collect();
    if pattern_segments.len() != topic_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(topic_segments.iter())
        .all(|(p, t)| *p == "*" || p == t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn wildcard_matching_on_dotted_segments() {
        assert!(pattern_matches("Agent.*", "Agent.created"));
        assert!(pattern_matches("Agent.*", "Agent.phase.changed"));
        assert!(pattern_matches("*.failed", "workflow.step.failed"));
        assert!(pattern_matches("scheduler.task.*", "scheduler.task.retry"));
        assert!(pattern_matches("a.*.c", "a.b.c"));
        assert!(!pattern_matches("a.*.c", "a.b.b.c"));
        assert!(!pattern_matches("Agent.*", "Tool.created"));
        assert!(!pattern_matches("*.failed", "workflow.completed"));
    }

    #[test]
    fn publish_is_fifo_within_a_topic_and_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = seen.clone();
        let _bad = bus.subscribe(
            "t.x",
            Arc::new(move |event: &BusEvent| -> Result<(), EventError> {
                seen_a.lock().unwrap().push(format!("a:{}", event.payload));
                Err(EventError::Handler("boom".into()))
            }),
        );
        let seen_b = seen.clone();
        let _good = bus.subscribe_fn("t.x", move |event| {
            seen_b.lock().unwrap().push(format!("b:{}", event.payload));
        });

        bus.publish("t.x", json!(1));
        bus.publish("t.x", json!(2));

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe_fn("t", |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn every_topic_is_mirrored_to_the_logger() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_log = seen.clone();
        let _log = bus.subscribe_fn(LOGGER_TOPIC, move |event| {
            seen_log.lock().unwrap().push(event.payload.clone());
        });

        bus.publish("Agent.created", json!({"name": "a"}));
        let entries = seen.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["topic"], "Agent.created");
    }
}
