// SPDX-License-Identifier: Apache-2.0
//! Multi-subscriber fan-out with slow-consumer isolation.
//!
//! `Publish` never blocks: a subscriber with a full queue drops the event
//! and is otherwise unaffected, and so are its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::LedgerEvent;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A live subscriber's receive side.
pub struct Subscription {
    pub id: u64,
    pub conversation_key: String,
    receiver: mpsc::Receiver<LedgerEvent>,
    broadcaster: std::sync::Weak<Inner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LedgerEvent> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broadcaster.upgrade() {
            inner.remove(&self.conversation_key, self.id);
        }
    }
}

struct Sub {
    id: u64,
    tx: mpsc::Sender<LedgerEvent>,
}

struct Inner {
    subscribers: Mutex<HashMap<String, Vec<Sub>>>,
    next_id: AtomicU64,
    drop_count: AtomicU64,
}

impl Inner {
    fn remove(&self, conversation_key: &str, id: u64) {
        let mut map = self.subscribers.lock().expect("broadcaster mutex poisoned");
        if let Some(subs) = map.get_mut(conversation_key) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                map.remove(conversation_key);
            }
        }
    }
}

/// Subject → set-of-subscriber-queues fan-out.
pub struct Broadcaster {
    inner: std::sync::Arc<Inner>,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                drop_count: AtomicU64::new(0),
            }),
            queue_capacity,
        }
    }

    /// Subscribe to a conversation key. The returned [`Subscription`]
    /// unsubscribes automatically when dropped (the caller's cancellation
    /// token owning it going away is the natural way this happens).
    pub fn subscribe(&self, conversation_key: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.inner
            .subscribers
            .lock()
            .expect("broadcaster mutex poisoned")
            .entry(conversation_key.to_string())
            .or_default()
            .push(Sub { id, tx });

        Subscription {
            id,
            conversation_key: conversation_key.to_string(),
            receiver: rx,
            broadcaster: std::sync::Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, conversation_key: &str, subscription_id: u64) {
        self.inner.remove(conversation_key, subscription_id);
    }

    /// Deliver `event` to every subscriber of `conversation_key` except
    /// `exclude_subscription_id`. Never blocks: a full subscriber queue
    /// drops the event for that subscriber only.
    pub fn publish(
        &self,
        conversation_key: &str,
        event: LedgerEvent,
        exclude_subscription_id: Option<u64>,
    ) {
        let map = self.inner.subscribers.lock().expect("broadcaster mutex poisoned");
        let Some(subs) = map.get(conversation_key) else {
            return;
        };
        for sub in subs {
            if Some(sub.id) == exclude_subscription_id {
                continue;
            }
            if sub.tx.try_send(event.clone()).is_err() {
                self.inner.drop_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    conversation_key,
                    subscription_id = sub.id,
                    "broadcaster dropped event for slow subscriber"
                );
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.inner.drop_count.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, conversation_key: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("broadcaster mutex poisoned")
            .get(conversation_key)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Close all handles by dropping every subscriber's sender side, which
    /// causes in-flight `recv()` calls to observe the channel closing.
    pub fn close(&self) {
        let mut map = self.inner.subscribers.lock().expect("broadcaster mutex poisoned");
        map.clear();
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_event(conversation_key: &str, text: &str) -> LedgerEvent {
    LedgerEvent {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_key: conversation_key.to_string(),
        direction: crate::model::EventDirection::OutboundFromAgent,
        author: "agent:test".to_string(),
        timestamp: chrono::Utc::now(),
        event_type: crate::model::EventType::Message,
        text: Some(text.to_string()),
        raw_transport: None,
        raw_payload_ref: None,
        actor_principal_id: None,
        actor_member_id: None,
    }
}
