//! In-process publish/subscribe for journal events.
//!
//! Two implementations share one subscription model:
//!
//! - [`LocalBus`]: `publish` runs every matching handler in registration order
//!   on the caller's thread and returns when all have finished.
//! - [`AsyncBus`]: `publish_async` only enqueues. A dispatch task dequeues
//!   events in FIFO order and fans each one out to its matching handlers,
//!   running sync handlers inline and awaiting async handlers as a group.
//!
//! In both, a failing or panicking handler is logged and does not stop the
//! remaining handlers.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::event::{Event, EventType};

mod local;
mod queued;

pub use local::LocalBus;
pub use queued::AsyncBus;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Which event types a subscriber receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    types: Option<HashSet<EventType>>,
}

impl EventFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I: IntoIterator<Item = EventType>>(types: I) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
        }
    }

    pub fn matches(&self, event_type: &EventType) -> bool {
        self.types
            .as_ref()
            .is_none_or(|types| types.contains(event_type))
    }
}

/// Synchronous event handler.
pub type SyncHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Where a workflow context publishes the events it journals.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Render a panic payload for logging.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
