// Copyright (c) 2025 Sandcastle Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-local publish/subscribe event bus for real-time run/step updates.
//!
//! Designed for a single-worker deployment: subscribers get a bounded
//! `tokio::sync::mpsc` receiver each, and a full queue means a dropped event
//! for that subscriber rather than back-pressure on the publisher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::{mpsc, Mutex};

const QUEUE_CAPACITY: usize = 256;

const EVENT_TYPES: &[&str] = &[
    "run.started",
    "run.completed",
    "run.failed",
    "step.started",
    "step.completed",
    "step.failed",
    "dlq.new",
];

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Event>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: std::sync::atomic::AtomicU64::new(0) }
    }

    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut subs = self.subscribers.lock().await;
        subs.push(Subscriber { id, sender: tx });
        tracing::debug!(total = subs.len(), "event bus: new subscriber");
        Subscription { id, receiver: rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| s.id != id);
        tracing::debug!(total = subs.len(), "event bus: subscriber removed");
    }

    /// Publishes an event to all subscribers. Never blocks: a subscriber
    /// whose queue is full simply misses this event.
    pub async fn publish(&self, event_type: &str, data: serde_json::Value) {
        if !EVENT_TYPES.contains(&event_type) {
            tracing::warn!(event_type, "event bus: unknown event type");
        }

        let event = Event { event_type: event_type.to_string(), data, timestamp: Utc::now() };

        let subs = self.subscribers.lock().await;
        for sub in subs.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.sender.try_send(event.clone()) {
                tracing::debug!(event_type, "event bus: dropping event for slow subscriber");
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

pub fn known_event_types() -> HashSet<&'static str> {
    EVENT_TYPES.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;
        bus.publish("run.started", serde_json::json!({"run_id": "r1"})).await;
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, "run.started");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let sub = bus.subscribe().await;
        bus.unsubscribe(sub.id).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_event_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().await;
        for _ in 0..QUEUE_CAPACITY + 10 {
            bus.publish("step.started", serde_json::json!({})).await;
        }
        let mut drained = 0;
        while sub.receiver.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, QUEUE_CAPACITY);
    }
}
