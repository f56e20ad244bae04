//! Shared application state for the daemon.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};
use waypoint::approval::ApprovalRegistry;
use waypoint::bus::{AsyncBus, EventFilter};
use waypoint::core::event::{Event, EventType};
use waypoint::io::run_index::{RunIndex, RunRecord};

use crate::tracker::{RunTracker, TrackedStatus};

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<RunTracker>,
    pub approvals: Arc<ApprovalRegistry>,
    /// Every accepted event goes through this bus.
    pub bus: Arc<AsyncBus>,
    /// Fan-out of dispatched events to SSE clients.
    pub event_tx: Arc<broadcast::Sender<Arc<Event>>>,
    /// Silence after which the sweeper marks a run stale.
    pub stale_after: Duration,
    /// How long finished and stale runs stay tracked before eviction.
    pub retain_for: Duration,
    /// Finished runs are recorded here when set.
    pub index: Option<RunIndex>,
}

impl AppState {
    /// Must be called inside a tokio runtime.
    pub fn new(stale_after: Duration, retain_for: Duration, index: Option<RunIndex>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let state = Self {
            tracker: Arc::new(RunTracker::new()),
            approvals: Arc::new(ApprovalRegistry::new()),
            bus: Arc::new(AsyncBus::start()),
            event_tx: Arc::new(event_tx),
            stale_after,
            retain_for,
            index,
        };

        let tracker = Arc::clone(&state.tracker);
        let approvals = Arc::clone(&state.approvals);
        let event_tx = Arc::clone(&state.event_tx);
        let index = state.index.clone();
        state.bus.subscribe(EventFilter::all(), move |event| {
            let event = Arc::new(event.clone());
            tracker.record_event(Arc::clone(&event));
            track_lifecycle(&tracker, &approvals, index.as_ref(), &event);
            // No receivers just means no SSE client is connected.
            let _ = event_tx.send(event);
            Ok(())
        });
        state
    }

    /// Mark silent runs stale, then evict runs quiet past the retention
    /// window along with their approvals. Returns the evicted ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        for run_id in self.tracker.sweep(self.stale_after, now) {
            warn!(run_id = %run_id, "no heartbeat within threshold; run marked stale");
        }
        let evicted = self.tracker.evict(self.retain_for, now);
        for run_id in &evicted {
            let dropped = self.approvals.forget_run(run_id);
            info!(run_id = %run_id, approvals = dropped, "run evicted");
        }
        evicted
    }
}

/// Fold lifecycle events into the tracker's status view.
fn track_lifecycle(
    tracker: &RunTracker,
    approvals: &ApprovalRegistry,
    index: Option<&RunIndex>,
    event: &Event,
) {
    let status = match event.event_type {
        EventType::WorkflowHeartbeat => {
            tracker.heartbeat(&event.run_id, event.timestamp);
            return;
        }
        EventType::WorkflowCompleted => TrackedStatus::Success,
        EventType::WorkflowFailed | EventType::WorkflowCancelled => TrackedStatus::Failed,
        _ => return,
    };
    tracker.mark_complete(&event.run_id, status, event.timestamp);
    approvals.forget_run(&event.run_id);

    let (Some(index), Some(manifest)) = (index, tracker.manifest(&event.run_id)) else {
        return;
    };
    let index = index.clone();
    let record = RunRecord::from_manifest(&manifest);
    // The index append syncs to disk; keep it off the dispatch task.
    tokio::task::spawn_blocking(move || {
        if let Err(err) = index.record(&record) {
            warn!(run_id = %record.run_id, err = %format!("{err:#}"), "failed to record run in index");
        }
    });
}
