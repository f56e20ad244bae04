use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EventFilter, EventSink, SubscriptionId, SyncHandler, panic_message};
use crate::core::event::Event;

type AsyncHandler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Handler,
}

type Subscribers = Arc<RwLock<Vec<Subscriber>>>;

enum Command {
    Event(Arc<Event>),
    Flush(oneshot::Sender<()>),
}

/// Queue-backed bus: publishing never waits for handlers.
///
/// Must be created inside a tokio runtime.
pub struct AsyncBus {
    next_id: AtomicU64,
    subscribers: Subscribers,
    tx: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl AsyncBus {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::default();
        let worker = tokio::spawn(dispatch_loop(rx, Arc::clone(&subscribers)));
        Self {
            next_id: AtomicU64::new(0),
            subscribers,
            tx,
            worker,
        }
    }

    /// Subscribe a handler that runs inline on the dispatch task.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(filter, Handler::Sync(Arc::new(handler)))
    }

    /// Subscribe an async handler; handlers for one event are awaited together.
    pub fn subscribe_async<F, Fut>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| handler(event).boxed());
        self.insert(filter, Handler::Async(handler))
    }

    fn insert(&self, filter: EventFilter, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                filter,
                handler,
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Enqueue `event` for dispatch and return immediately.
    pub fn publish_async(&self, event: Event) {
        if self.tx.send(Command::Event(Arc::new(event))).is_err() {
            warn!("event bus dispatcher stopped; dropping event");
        }
    }

    /// Wait until every event published before this call has been dispatched.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Drain the queue and stop the dispatch task.
    pub async fn shutdown(self) {
        let Self { tx, worker, .. } = self;
        drop(tx);
        if let Err(err) = worker.await {
            warn!(err = %err, "event bus dispatcher ended abnormally");
        }
    }
}

impl EventSink for AsyncBus {
    fn emit(&self, event: &Event) {
        self.publish_async(event.clone());
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Command>, subscribers: Subscribers) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(event) => dispatch(&subscribers, event).await,
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("event bus dispatcher drained");
}

async fn dispatch(subscribers: &Subscribers, event: Arc<Event>) {
    let handlers: Vec<Handler> = subscribers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|s| s.filter.matches(&event.event_type))
        .map(|s| s.handler.clone())
        .collect();

    let mut pending = Vec::new();
    for handler in handlers {
        match handler {
            Handler::Sync(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => report_error(&event, &err),
                Err(payload) => report_panic(&event, &panic_message(payload.as_ref())),
            },
            Handler::Async(handler) => {
                pending.push(AssertUnwindSafe(handler(Arc::clone(&event))).catch_unwind());
            }
        }
    }

    for outcome in join_all(pending).await {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => report_error(&event, &err),
            Err(payload) => report_panic(&event, &panic_message(payload.as_ref())),
        }
    }
}

fn report_error(event: &Event, err: &anyhow::Error) {
    warn!(event_type = %event.event_type, err = %format!("{err:#}"), "event handler failed");
}

fn report_panic(event: &Event, message: &str) {
    warn!(event_type = %event.event_type, panic = %message, "event handler panicked");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventType, StepStarted};
    use std::sync::Mutex;
    use std::time::Duration;

    fn event(step: &str) -> Event {
        Event::new(
            EventType::StepStarted,
            "wf",
            "run-1",
            &StepStarted {
                step: step.to_string(),
            },
        )
        .expect("event")
    }

    fn step_of(event: &Event) -> String {
        event
            .decode::<StepStarted>()
            .map(|p| p.step)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn async_handlers_see_publish_order_even_when_slow() {
        let bus = AsyncBus::start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        bus.subscribe_async(EventFilter::all(), move |event| {
            let log = Arc::clone(&log);
            async move {
                // Earlier events sleep longer; order must still hold.
                let step = step_of(&event);
                let delay = if step == "0" { 30 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().expect("lock").push(step);
                Ok(())
            }
        });

        for i in 0..5 {
            bus.publish_async(event(&i.to_string()));
        }
        bus.flush().await;
        assert_eq!(*seen.lock().expect("lock"), vec!["0", "1", "2", "3", "4"]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn publish_does_not_wait_for_handlers() {
        let bus = AsyncBus::start();
        let (tx, rx) = oneshot::channel::<()>();
        let gate = Arc::new(tokio::sync::Mutex::new(Some(rx)));
        let done = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&done);
        bus.subscribe_async(EventFilter::all(), move |_| {
            let gate = Arc::clone(&gate);
            let counter = Arc::clone(&counter);
            async move {
                if let Some(rx) = gate.lock().await.take() {
                    let _ = rx.await;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.publish_async(event("a"));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        tx.send(()).expect("release");
        bus.flush().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_others() {
        let bus = AsyncBus::start();
        let count = Arc::new(AtomicU64::new(0));
        bus.subscribe(EventFilter::all(), |_| Err(anyhow::anyhow!("sync boom")));
        bus.subscribe_async(EventFilter::all(), |_| async {
            Err(anyhow::anyhow!("async boom"))
        });
        let counter = Arc::clone(&count);
        bus.subscribe(EventFilter::all(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish_async(event("a"));
        bus.publish_async(event("b"));
        bus.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
