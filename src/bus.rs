//! Topic-keyed pub/sub for session observers
//!
//! Every subscription owns a bounded queue. `publish` never blocks: when a
//! subscriber's queue is full its oldest message is discarded and the drop
//! is counted on that subscription and on the bus.
//!
//! Topics in use:
//! - `logs` - human-readable session log lines
//! - `events` - domain events (`order_filled`, `order_rejected`, `target_hit`, ...)
//! - `prices` and `prices:<INSTRUMENT>` - closed bars

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const TOPIC_LOGS: &str = "logs";
pub const TOPIC_EVENTS: &str = "events";
pub const TOPIC_PRICES: &str = "prices";

/// Per-instrument price topic
pub fn price_topic(instrument: &str) -> String {
    format!("{TOPIC_PRICES}:{instrument}")
}

/// Envelope delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    /// Bus-wide publish sequence
    pub seq: u64,
    pub time: DateTime<Utc>,
    pub payload: serde_json::Value,
}

struct SubscriberQueue {
    id: u64,
    capacity: usize,
    buffer: Mutex<VecDeque<BusMessage>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    /// Returns true when an older message had to be evicted
    fn push(&self, message: BusMessage) -> bool {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let evicted = if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        buffer.push_back(message);
        drop(buffer);
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<BusMessage> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct BusInner {
    topics: DashMap<String, Vec<Arc<SubscriberQueue>>>,
    capacity: usize,
    next_id: AtomicU64,
    seq: AtomicU64,
    dropped_total: AtomicU64,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for entry in self.topics.iter() {
            for queue in entry.value() {
                queue.close();
            }
        }
    }
}

/// Cloneable handle to a shared bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose subscriptions each hold at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                seq: AtomicU64::new(0),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver to every current subscriber of `topic`; returns the number reached
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(value) => self.publish_value(topic, value),
            Err(e) => {
                warn!("EventBus: could not serialize payload for {}: {}", topic, e);
                0
            }
        }
    }

    pub fn publish_value(&self, topic: &str, payload: serde_json::Value) -> usize {
        let Some(queues) = self.inner.topics.get(topic) else {
            return 0;
        };
        if queues.is_empty() {
            return 0;
        }

        let message = BusMessage {
            topic: topic.to_string(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            time: Utc::now(),
            payload,
        };

        let mut dropped = 0u64;
        for queue in queues.iter() {
            if queue.push(message.clone()) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.inner.dropped_total.fetch_add(dropped, Ordering::Relaxed);
            debug!("EventBus: {} dropped {} message(s) (queue full)", topic, dropped);
        }
        queues.len()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            capacity: self.inner.capacity,
            buffer: Mutex::new(VecDeque::with_capacity(self.inner.capacity.min(64))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(queue.clone());

        Subscription {
            topic: topic.to_string(),
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map(|q| q.len()).unwrap_or(0)
    }

    /// Topics with at least one live subscription
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    /// Drops across all subscriptions since the bus was created
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }
}

/// Receiving side of one topic subscription; detaches on drop
pub struct Subscription {
    topic: String,
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message; `None` once the bus is gone and the queue is drained
    pub async fn recv(&self) -> Option<BusMessage> {
        loop {
            if let Some(message) = self.queue.pop() {
                return Some(message);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<BusMessage> {
        self.queue.pop()
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages discarded from this subscription because its queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn unsubscribe(self) {}

    /// Lazy stream of messages; ends when the bus shuts down
    pub fn into_stream(self) -> impl Stream<Item = BusMessage> + Send + 'static {
        futures::stream::unfold(self, |sub| async move {
            let message = sub.recv().await?;
            Some((message, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(bus) = self.bus.upgrade() {
            let emptied = match bus.topics.get_mut(&self.topic) {
                Some(mut queues) => {
                    queues.retain(|q| q.id != self.queue.id);
                    queues.is_empty()
                }
                None => false,
            };
            // Guard released above; a concurrent subscribe keeps the entry
            if emptied {
                bus.topics.remove_if(&self.topic, |_, queues| queues.is_empty());
            }
        }
    }
}
