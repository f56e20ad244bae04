//! In-memory view of the runs connected to the daemon.
//!
//! Runs report in over HTTP: they register, heartbeat, publish events, wait on
//! approvals and complete. A run whose heartbeats stop for longer than the
//! stale threshold is marked `stale` by the sweeper; a later heartbeat revives
//! it. Finished and stale runs are evicted, history included, once they have
//! been quiet for the retention window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use waypoint::core::event::Event;
use waypoint::core::manifest::{self, Manifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedStatus {
    Running,
    /// Suspended on an approval.
    Waiting,
    Stale,
    Success,
    Failed,
}

impl TrackedStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedRun {
    pub run_id: String,
    pub workflow_id: String,
    pub status: TrackedStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<String>,
    pub event_count: usize,
}

/// An event as seen by pollers, numbered per run from 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencedEvent {
    pub seq: usize,
    pub event: Arc<Event>,
}

struct RunEntry {
    run: TrackedRun,
    events: Vec<Arc<Event>>,
}

#[derive(Default)]
pub struct RunTracker {
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunEntry>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a run. Registering a known run only refreshes its
    /// heartbeat.
    pub fn register(&self, run_id: &str, workflow_id: &str, now: DateTime<Utc>) -> TrackedRun {
        let mut runs = self.lock();
        let entry = runs.entry(run_id.to_string()).or_insert_with(|| {
            info!(run_id, workflow_id, "run registered");
            RunEntry {
                run: TrackedRun {
                    run_id: run_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    status: TrackedStatus::Running,
                    registered_at: now,
                    last_heartbeat: now,
                    finished_at: None,
                    waiting_on: None,
                    event_count: 0,
                },
                events: Vec::new(),
            }
        });
        entry.run.last_heartbeat = now;
        entry.run.clone()
    }

    pub fn get(&self, run_id: &str) -> Option<TrackedRun> {
        self.lock().get(run_id).map(|entry| entry.run.clone())
    }

    /// Record liveness. Returns `None` for unknown runs.
    pub fn heartbeat(&self, run_id: &str, now: DateTime<Utc>) -> Option<TrackedRun> {
        self.update(run_id, |run| {
            run.last_heartbeat = now;
            if run.status == TrackedStatus::Stale {
                info!(run_id = %run.run_id, "stale run is alive again");
                run.status = if run.waiting_on.is_some() {
                    TrackedStatus::Waiting
                } else {
                    TrackedStatus::Running
                };
            }
        })
    }

    pub fn mark_waiting(&self, run_id: &str, step: &str) -> Option<TrackedRun> {
        self.update(run_id, |run| {
            if !run.status.is_terminal() {
                run.status = TrackedStatus::Waiting;
                run.waiting_on = Some(step.to_string());
            }
        })
    }

    /// Clear a wait on `step` once its approval settled.
    pub fn clear_waiting(&self, run_id: &str, step: &str) -> Option<TrackedRun> {
        self.update(run_id, |run| {
            if run.waiting_on.as_deref() == Some(step) {
                run.waiting_on = None;
                if run.status == TrackedStatus::Waiting {
                    run.status = TrackedStatus::Running;
                }
            }
        })
    }

    /// Terminal statuses are final; completing twice keeps the first.
    pub fn mark_complete(
        &self,
        run_id: &str,
        status: TrackedStatus,
        at: DateTime<Utc>,
    ) -> Option<TrackedRun> {
        self.update(run_id, |run| {
            if !run.status.is_terminal() {
                run.status = status;
                run.finished_at = Some(at);
                run.waiting_on = None;
                info!(run_id = %run.run_id, status = ?status, "run completed");
            }
        })
    }

    /// Append an event to its run's history, registering the run if needed.
    /// Returns the event's sequence number.
    pub fn record_event(&self, event: Arc<Event>) -> usize {
        let mut runs = self.lock();
        let entry = runs
            .entry(event.run_id.clone())
            .or_insert_with(|| RunEntry {
                run: TrackedRun {
                    run_id: event.run_id.clone(),
                    workflow_id: event.workflow_id.clone(),
                    status: TrackedStatus::Running,
                    registered_at: event.timestamp,
                    last_heartbeat: event.timestamp,
                    finished_at: None,
                    waiting_on: None,
                    event_count: 0,
                },
                events: Vec::new(),
            });
        entry.events.push(event);
        entry.run.event_count = entry.events.len();
        entry.events.len() - 1
    }

    /// Events of `run_id` with `seq >= since`, or `None` for unknown runs.
    pub fn events_since(&self, run_id: &str, since: usize) -> Option<Vec<SequencedEvent>> {
        let runs = self.lock();
        let entry = runs.get(run_id)?;
        Some(
            entry
                .events
                .iter()
                .enumerate()
                .skip(since)
                .map(|(seq, event)| SequencedEvent {
                    seq,
                    event: Arc::clone(event),
                })
                .collect(),
        )
    }

    /// Fold the run's received events into a manifest.
    pub fn manifest(&self, run_id: &str) -> Option<Manifest> {
        let runs = self.lock();
        let entry = runs.get(run_id)?;
        Some(manifest::reduce(entry.events.iter().map(|event| &**event)))
    }

    /// Every tracked run, oldest registration first.
    pub fn list(&self) -> Vec<TrackedRun> {
        let mut runs: Vec<TrackedRun> = self.lock().values().map(|entry| entry.run.clone()).collect();
        runs.sort_by(|a, b| {
            (a.registered_at, &a.run_id).cmp(&(b.registered_at, &b.run_id))
        });
        runs
    }

    /// Mark non-terminal runs stale when their last heartbeat is older than
    /// `stale_after`. Returns the ids newly marked.
    pub fn sweep(&self, stale_after: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut marked = Vec::new();
        for entry in self.lock().values_mut() {
            let run = &mut entry.run;
            if run.status.is_terminal() || run.status == TrackedStatus::Stale {
                continue;
            }
            let idle = (now - run.last_heartbeat).to_std().unwrap_or_default();
            if idle >= stale_after {
                run.status = TrackedStatus::Stale;
                marked.push(run.run_id.clone());
            }
        }
        marked.sort();
        debug!(marked = marked.len(), "stale sweep finished");
        marked
    }

    /// Forget terminal runs finished, and stale runs silent, for at least
    /// `retain_for`. Returns the evicted ids.
    pub fn evict(&self, retain_for: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut evicted = Vec::new();
        self.lock().retain(|run_id, entry| {
            let run = &entry.run;
            let quiet_since = match run.status {
                TrackedStatus::Success | TrackedStatus::Failed => {
                    run.finished_at.unwrap_or(run.last_heartbeat)
                }
                TrackedStatus::Stale => run.last_heartbeat,
                TrackedStatus::Running | TrackedStatus::Waiting => return true,
            };
            if (now - quiet_since).to_std().unwrap_or_default() < retain_for {
                return true;
            }
            evicted.push(run_id.clone());
            false
        });
        evicted.sort();
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "tracked runs evicted");
        }
        evicted
    }

    fn update<F: FnOnce(&mut TrackedRun)>(&self, run_id: &str, f: F) -> Option<TrackedRun> {
        let mut runs = self.lock();
        let entry = runs.get_mut(run_id)?;
        f(&mut entry.run);
        Some(entry.run.clone())
    }
}
