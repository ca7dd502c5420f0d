// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process typed publish/subscribe.
//!
//! Each topic fans out to any number of subscribers; each subscriber owns a
//! bounded inbox. Publishing never blocks: when an inbox is full the oldest
//! queued event is discarded and counted. Delivery is FIFO per subscriber.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::event::{DetectionEvent, KeepaliveEvent};

/// Default per-subscriber inbox capacity.
const INBOX_CAPACITY: usize = 64;

/// All topics the agent publishes on.
pub struct Bus {
    pub detection: Topic<DetectionEvent>,
    pub keepalive: Topic<KeepaliveEvent>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            detection: Topic::new("ai.detection", INBOX_CAPACITY),
            keepalive: Topic::new("ai.keepalive", INBOX_CAPACITY),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// One named topic carrying events of type `T`.
pub struct Topic<T> {
    name: &'static str,
    capacity: usize,
    inner: Arc<TopicInner<T>>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self { name: self.name, capacity: self.capacity, inner: Arc::clone(&self.inner) }
    }
}

struct TopicInner<T> {
    subs: Mutex<Vec<SubEntry<T>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

struct SubEntry<T> {
    id: u64,
    inbox: Arc<Inbox<T>>,
}

struct Inbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: Arc::new(TopicInner {
                subs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue `event` to every subscriber. Never blocks; a full inbox drops
    /// its oldest entry.
    pub fn publish(&self, event: T) {
        let subs = self.inner.subs.lock();
        for sub in subs.iter() {
            let mut queue = sub.inbox.queue.lock();
            if queue.len() == sub.inbox.capacity {
                queue.pop_front();
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(topic = self.name, total, "subscriber inbox full, dropped oldest event");
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.inbox.notify.notify_one();
        }
    }

    /// Register a subscriber and return its inbox handle. Dropping the
    /// handle unsubscribes.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox {
            queue: Mutex::new(VecDeque::with_capacity(self.capacity)),
            capacity: self.capacity,
            notify: Notify::new(),
        });
        self.inner.subs.lock().push(SubEntry { id, inbox: Arc::clone(&inbox) });
        Subscription { id, topic: Arc::clone(&self.inner), inbox }
    }

    /// Total events this topic has dropped across all subscribers.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.lock().len()
    }
}

/// A registered subscriber's receiving half.
pub struct Subscription<T> {
    id: u64,
    topic: Arc<TopicInner<T>>,
    inbox: Arc<Inbox<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next event, in publish order.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(event) = self.inbox.queue.lock().pop_front() {
                return event;
            }
            self.inbox.notify.notified().await;
        }
    }

    /// Pop the next event if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        self.inbox.queue.lock().pop_front()
    }

    /// Deregister explicitly. Equivalent to dropping; unsubscribing twice is
    /// a no-op.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.topic.subs.lock().retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
