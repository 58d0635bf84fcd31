//! Ordered per-task event fan-out.
//!
//! Subscribers register a bounded queue per task. Publishing never blocks
//! the producer: a subscriber whose queue is full simply misses that event,
//! and a subscriber that went away is pruned on the next publish. Events
//! reach each subscriber in the order the driver/scheduler produced them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use courier_store::models::TaskEvent;

/// Queue capacity per subscriber.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<TaskEvent>,
}

struct Registry {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Registry {
    fn unsubscribe(&self, task_id: &str, id: u64) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        if let Some(entries) = subscribers.get_mut(task_id) {
            entries.retain(|sub| sub.id != id);
            if entries.is_empty() {
                subscribers.remove(task_id);
            }
        }
    }
}

/// Cheaply cloneable handle to the shared subscriber registry.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<Registry>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    /// Construct with an explicit per-subscriber queue capacity (tests).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    /// Register a subscriber for one task's events.
    ///
    /// The subscription unregisters itself when dropped.
    pub fn subscribe(&self, task_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.registry.capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .entry(task_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        Subscription {
            task_id: task_id.to_string(),
            id,
            rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Deliver an event to every subscriber of its task.
    ///
    /// Never suspends: full queues are skipped, dead subscribers pruned.
    pub fn publish(&self, event: &TaskEvent) {
        let mut subscribers = self
            .registry
            .subscribers
            .lock()
            .expect("subscriber lock poisoned");
        let Some(entries) = subscribers.get_mut(&event.task_id) else {
            return;
        };

        entries.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    task_id = %event.task_id,
                    event = %event.kind,
                    "subscriber queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if entries.is_empty() {
            subscribers.remove(&event.task_id);
        }
    }

    /// Number of live subscribers for a task.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.registry
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .get(task_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of a task's event stream.
pub struct Subscription {
    task_id: String,
    id: u64,
    rx: mpsc::Receiver<TaskEvent>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Next event, or `None` once the stream is finished and drained.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant used when draining after `task_done`.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.task_id, self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
