//! Change events and the subscriber registry.
//!
//! Flushes and deletes append [`ChangeEvent`]s to the transaction's
//! [`EventBuffer`]. At commit the buffer is delivered, in order, to a
//! snapshot of the [`EventBus`] subscribers and then cleared.
//!
//! The bus is the only structure shared across threads. Writers copy the
//! subscriber list and swap it in; readers clone the current `Arc` and
//! iterate without holding the lock, so a subscription change never blocks
//! or disturbs an in-flight delivery.

use serde::{Deserialize, Serialize};
use sqldao_core::EntityId;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Updated,
    Removed,
}

/// Immutable record of one row change inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub id: EntityId,
    pub kind: ChangeKind,
    pub transaction_id: u64,
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

struct BusInner {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Registry of change subscribers, cheap to clone and share.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback for every delivered event.
    pub fn subscribe(&self, callback: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Subscriber> = guard.iter().cloned().collect();
        next.push(Subscriber {
            id,
            callback: Arc::new(callback),
        });
        *guard = Arc::new(next);
        tracing::trace!(subscription = id.0, "Subscribed to change events");
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|s| s.id == id) {
            return false;
        }
        let next: Vec<Subscriber> = guard
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Vec<Subscriber>> {
        Arc::clone(
            &self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Deliver events in order to the subscribers registered right now.
    ///
    /// A panicking subscriber is logged and skipped; the remaining
    /// subscribers and events are still delivered.
    pub fn publish(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let subscribers = self.snapshot();
        tracing::debug!(
            events = events.len(),
            subscribers = subscribers.len(),
            "Delivering change events"
        );
        for event in events {
            for subscriber in subscribers.iter() {
                let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event)));
                if outcome.is_err() {
                    tracing::warn!(
                        subscription = subscriber.id.0,
                        table = %event.table,
                        id = %event.id,
                        "Change subscriber panicked; event dropped for this subscriber"
                    );
                }
            }
        }
    }
}

/// Per-transaction event log.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: RefCell<Vec<ChangeEvent>>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event unless it repeats the previous one.
    pub fn push(&self, event: ChangeEvent) {
        let mut events = self.events.borrow_mut();
        if events.last() == Some(&event) {
            return;
        }
        events.push(event);
    }

    pub fn snapshot(&self) -> Vec<ChangeEvent> {
        self.events.borrow().clone()
    }

    /// Remove and return every buffered event.
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}
