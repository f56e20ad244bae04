use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{EventFilter, EventSink, SubscriptionId, SyncHandler, panic_message};
use crate::core::event::Event;

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: SyncHandler,
}

/// Synchronous bus: handlers run on the publishing thread.
#[derive(Default)]
pub struct LocalBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                filter,
                handler: Arc::new(handler),
            });
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every matching handler, in registration order.
    pub fn publish(&self, event: &Event) {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<SyncHandler> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.filter.matches(&event.event_type))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        debug!(event_type = %event.event_type, handlers = handlers.len(), "publish");

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event_type = %event.event_type, err = %format!("{err:#}"), "event handler failed");
                }
                Err(payload) => {
                    warn!(event_type = %event.event_type, panic = %panic_message(payload.as_ref()), "event handler panicked");
                }
            }
        }
    }
}

impl EventSink for LocalBus {
    fn emit(&self, event: &Event) {
        self.publish(event);
    }
}
