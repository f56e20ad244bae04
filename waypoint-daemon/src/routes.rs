//! HTTP route handlers for the daemon API.

use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use waypoint::approval::{ApprovalError, ApprovalState, Decision, PendingApproval, TIMED_OUT};
use waypoint::context::generate_run_id;
use waypoint::core::event::{
    ApprovalReceived, ApprovalRequested, Event, EventType, WorkflowFailed,
};
use waypoint::core::manifest::Manifest;

use crate::state::AppState;
use crate::tracker::{SequencedEvent, TrackedRun};

const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_POLL_SECS: u64 = 30;
const MAX_POLL_SECS: u64 = 300;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(register_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/events", get(poll_events).post(publish_event))
        .route("/runs/{run_id}/heartbeat", post(heartbeat))
        .route("/runs/{run_id}/waiting", post(mark_waiting))
        .route("/runs/{run_id}/approvals/{step}", get(poll_approval))
        .route("/runs/{run_id}/complete", post(mark_complete))
        .route("/approvals", get(list_pending))
        .route("/approvals/{run_id}/{step}", post(submit_decision))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct RegisterRun {
    pub workflow_id: String,
    /// Generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// POST /api/runs - start tracking a run.
pub async fn register_run(
    State(state): State<AppState>,
    Json(body): Json<RegisterRun>,
) -> Result<Json<TrackedRun>, StatusCode> {
    if body.workflow_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let run_id = body.run_id.unwrap_or_else(generate_run_id);
    Ok(Json(state.tracker.register(&run_id, &body.workflow_id, Utc::now())))
}

/// GET /api/runs - every tracked run.
pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<TrackedRun>> {
    Json(state.tracker.list())
}

#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: TrackedRun,
    pub manifest: Manifest,
}

/// GET /api/runs/:run_id - tracked status plus the manifest of its events.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, StatusCode> {
    let run = state.tracker.get(&run_id).ok_or(StatusCode::NOT_FOUND)?;
    let manifest = state
        .tracker
        .manifest(&run_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(RunDetail { run, manifest }))
}

#[derive(Debug, Deserialize)]
pub struct PublishEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// POST /api/runs/:run_id/events - enqueue an event on the bus.
pub async fn publish_event(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<PublishEvent>,
) -> Result<StatusCode, StatusCode> {
    let run = state.tracker.get(&run_id).ok_or(StatusCode::NOT_FOUND)?;
    let event = Event::new(body.event_type, run.workflow_id, run_id, &body.payload)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    debug!(run_id = %event.run_id, event_type = %event.event_type, "event received");
    state.bus.publish_async(event);
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: usize,
}

/// GET /api/runs/:run_id/events?since=N - dispatched events from `seq` N on.
pub async fn poll_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Vec<SequencedEvent>>, StatusCode> {
    state
        .tracker
        .events_since(&run_id, query.since)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/runs/:run_id/heartbeat - record liveness.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<TrackedRun>, StatusCode> {
    state
        .tracker
        .heartbeat(&run_id, Utc::now())
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
pub struct WaitingRequest {
    pub step: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

fn default_approval_timeout() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT_SECS
}

/// POST /api/runs/:run_id/waiting - suspend the run on an approval.
///
/// The decision is awaited on a spawned task, so other runs keep progressing.
/// When it arrives (or the timeout passes) `approval.received` is published.
pub async fn mark_waiting(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<WaitingRequest>,
) -> Result<Json<TrackedRun>, StatusCode> {
    let run = state.tracker.get(&run_id).ok_or(StatusCode::NOT_FOUND)?;
    if run.status.is_terminal() {
        return Err(StatusCode::CONFLICT);
    }
    let (handle, opened) = state
        .approvals
        .open_request(&run_id, &body.step, &body.prompt);
    let run = state
        .tracker
        .mark_waiting(&run_id, &body.step)
        .ok_or(StatusCode::NOT_FOUND)?;
    if !opened {
        return Ok(Json(run));
    }

    let requested = Event::new(
        EventType::ApprovalRequested,
        run.workflow_id.as_str(),
        run_id.as_str(),
        &ApprovalRequested {
            step: body.step.clone(),
            prompt: body.prompt,
        },
    )
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.bus.publish_async(requested);

    let timeout = Duration::from_secs(body.timeout_secs);
    let workflow_id = run.workflow_id.clone();
    let task_state = state.clone();
    tokio::spawn(async move {
        let decision = match task_state
            .approvals
            .await_decision_async(&handle, timeout)
            .await
        {
            Ok(decision) => decision.as_str().to_string(),
            Err(ApprovalError::Timeout { .. }) => TIMED_OUT.to_string(),
            Err(err) => {
                debug!(approval = %handle.key, err = %err, "approval dropped before a decision");
                return;
            }
        };
        let received = Event::new(
            EventType::ApprovalReceived,
            workflow_id,
            handle.key.run_id.as_str(),
            &ApprovalReceived {
                step: handle.key.step_name.clone(),
                decision,
            },
        );
        match received {
            Ok(event) => task_state.bus.publish_async(event),
            Err(err) => warn!(approval = %handle.key, err = %err, "failed to build approval event"),
        }
        task_state
            .tracker
            .clear_waiting(&handle.key.run_id, &handle.key.step_name);
    });

    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// GET /api/runs/:run_id/approvals/:step?timeout_secs=N - wait up to N seconds
/// for the request to settle and return its state.
pub async fn poll_approval(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(String, String)>,
    Query(query): Query<PollQuery>,
) -> Result<Json<ApprovalState>, StatusCode> {
    let handle = state
        .approvals
        .handle(&run_id, &step)
        .ok_or(StatusCode::NOT_FOUND)?;
    let within = Duration::from_secs(
        query
            .timeout_secs
            .unwrap_or(DEFAULT_POLL_SECS)
            .min(MAX_POLL_SECS),
    );
    state
        .approvals
        .watch_state(&handle, within)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Success,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub status: Completion,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/runs/:run_id/complete - publish the run's terminal event.
pub async fn mark_complete(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<TrackedRun>, StatusCode> {
    let run = state.tracker.get(&run_id).ok_or(StatusCode::NOT_FOUND)?;
    if run.status.is_terminal() {
        return Ok(Json(run));
    }
    let event = match body.status {
        Completion::Success => Event::new(
            EventType::WorkflowCompleted,
            run.workflow_id.as_str(),
            run_id.as_str(),
            &(),
        ),
        Completion::Failed => Event::new(
            EventType::WorkflowFailed,
            run.workflow_id.as_str(),
            run_id.as_str(),
            &WorkflowFailed {
                reason: body.reason.unwrap_or_else(|| "failed".to_string()),
            },
        ),
    }
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.bus.publish_async(event);
    state.bus.flush().await;
    info!(run_id = %run_id, status = ?body.status, "run marked complete");
    state
        .tracker
        .get(&run_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/approvals - requests awaiting a decision.
pub async fn list_pending(State(state): State<AppState>) -> Json<Vec<PendingApproval>> {
    Json(state.approvals.pending())
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub decision: Decision,
}

/// POST /api/approvals/:run_id/:step - resolve a pending request.
pub async fn submit_decision(
    State(state): State<AppState>,
    Path((run_id, step)): Path<(String, String)>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<ApprovalState>, StatusCode> {
    state
        .approvals
        .resolve(&run_id, &step, body.decision)
        .map_err(|err| match err {
            ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
            ApprovalError::AlreadyResolved(_) | ApprovalError::Timeout { .. } => {
                StatusCode::CONFLICT
            }
        })?;
    Ok(Json(ApprovalState::Resolved(body.decision)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackedStatus;
    use waypoint::io::run_index::{RunFilter, RunIndex};

    fn state() -> AppState {
        AppState::new(Duration::from_secs(60), Duration::from_secs(3600), None)
    }

    async fn register(state: &AppState, run_id: &str) -> TrackedRun {
        let Json(run) = register_run(
            State(state.clone()),
            Json(RegisterRun {
                workflow_id: "wf".to_string(),
                run_id: Some(run_id.to_string()),
            }),
        )
        .await
        .expect("register");
        run
    }

    fn waiting(step: &str, timeout_secs: u64) -> Json<WaitingRequest> {
        Json(WaitingRequest {
            step: step.to_string(),
            prompt: format!("approve {step}?"),
            timeout_secs,
        })
    }

    async fn events_of(state: &AppState, run_id: &str) -> Vec<SequencedEvent> {
        state.bus.flush().await;
        let Json(events) = poll_events(
            State(state.clone()),
            Path(run_id.to_string()),
            Query(SinceQuery::default()),
        )
        .await
        .expect("known run");
        events
    }

    #[tokio::test]
    async fn published_events_are_polled_in_order() {
        let state = state();
        register(&state, "r1").await;
        for event_type in [EventType::WorkflowStarted, EventType::StepStarted] {
            let status = publish_event(
                State(state.clone()),
                Path("r1".to_string()),
                Json(PublishEvent {
                    event_type,
                    payload: Map::new(),
                }),
            )
            .await
            .expect("publish");
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        let events = events_of(&state, "r1").await;
        let types: Vec<EventType> = events.iter().map(|e| e.event.event_type.clone()).collect();
        assert_eq!(types, vec![EventType::WorkflowStarted, EventType::StepStarted]);

        let Json(tail) = poll_events(
            State(state.clone()),
            Path("r1".to_string()),
            Query(SinceQuery { since: 1 }),
        )
        .await
        .expect("known run");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 1);
    }

    #[tokio::test]
    async fn unknown_runs_are_not_found() {
        let state = state();
        let err = heartbeat(State(state.clone()), Path("ghost".to_string()))
            .await
            .expect_err("unknown run");
        assert_eq!(err, StatusCode::NOT_FOUND);

        let err = publish_event(
            State(state.clone()),
            Path("ghost".to_string()),
            Json(PublishEvent {
                event_type: EventType::StepStarted,
                payload: Map::new(),
            }),
        )
        .await
        .expect_err("unknown run");
        assert_eq!(err, StatusCode::NOT_FOUND);

        let err = poll_approval(
            State(state),
            Path(("ghost".to_string(), "deploy".to_string())),
            Query(PollQuery::default()),
        )
        .await
        .expect_err("no request");
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn decision_wakes_the_waiting_run_without_blocking_others() {
        let state = state();
        register(&state, "r1").await;
        register(&state, "r2").await;

        let Json(run) = mark_waiting(State(state.clone()), Path("r1".to_string()), waiting("deploy", 60))
            .await
            .expect("waiting");
        assert_eq!(run.status, TrackedStatus::Waiting);

        // r2 keeps working while r1 waits.
        let Json(other) = heartbeat(State(state.clone()), Path("r2".to_string()))
            .await
            .expect("heartbeat");
        assert_eq!(other.status, TrackedStatus::Running);

        let Json(pending) = list_pending(State(state.clone())).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].step_name, "deploy");

        let poller = tokio::spawn(poll_approval(
            State(state.clone()),
            Path(("r1".to_string(), "deploy".to_string())),
            Query(PollQuery {
                timeout_secs: Some(10),
            }),
        ));

        let Json(resolved) = submit_decision(
            State(state.clone()),
            Path(("r1".to_string(), "deploy".to_string())),
            Json(DecisionBody {
                decision: Decision::Approve,
            }),
        )
        .await
        .expect("resolve");
        assert_eq!(resolved, ApprovalState::Resolved(Decision::Approve));

        let Json(polled) = poller.await.expect("join").expect("poll");
        assert_eq!(polled, ApprovalState::Resolved(Decision::Approve));

        let again = submit_decision(
            State(state.clone()),
            Path(("r1".to_string(), "deploy".to_string())),
            Json(DecisionBody {
                decision: Decision::Reject,
            }),
        )
        .await
        .expect_err("second decision");
        assert_eq!(again, StatusCode::CONFLICT);

        // The waiter task publishes approval.received once it observes the decision.
        let mut received = None;
        for _ in 0..50 {
            let events = events_of(&state, "r1").await;
            received = events
                .iter()
                .find(|e| e.event.event_type == EventType::ApprovalReceived)
                .cloned();
            if received.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let received = received.expect("approval.received published");
        let payload: ApprovalReceived = received.event.decode().expect("payload");
        assert_eq!(payload.decision, "approve");
        assert_eq!(
            state.tracker.get("r1").map(|r| r.status),
            Some(TrackedStatus::Running)
        );
    }

    #[tokio::test]
    async fn unanswered_approval_times_out() {
        let state = state();
        register(&state, "r1").await;
        mark_waiting(State(state.clone()), Path("r1".to_string()), waiting("deploy", 0))
            .await
            .expect("waiting");

        let Json(polled) = poll_approval(
            State(state.clone()),
            Path(("r1".to_string(), "deploy".to_string())),
            Query(PollQuery {
                timeout_secs: Some(5),
            }),
        )
        .await
        .expect("poll");
        assert_eq!(polled, ApprovalState::TimedOut);
    }

    #[tokio::test]
    async fn completion_records_the_run_in_the_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = RunIndex::new(dir.path().join("index.jsonl"));
        let state = AppState::new(
            Duration::from_secs(60),
            Duration::from_secs(3600),
            Some(index.clone()),
        );
        register(&state, "r1").await;
        publish_event(
            State(state.clone()),
            Path("r1".to_string()),
            Json(PublishEvent {
                event_type: EventType::WorkflowStarted,
                payload: Map::new(),
            }),
        )
        .await
        .expect("publish");

        let Json(run) = mark_complete(
            State(state.clone()),
            Path("r1".to_string()),
            Json(CompleteRequest {
                status: Completion::Failed,
                reason: Some("boom".to_string()),
            }),
        )
        .await
        .expect("complete");
        assert_eq!(run.status, TrackedStatus::Failed);

        // The index append runs on the blocking pool.
        let mut records = Vec::new();
        for _ in 0..100 {
            records = index
                .list(&RunFilter::default(), 0, 10)
                .expect("list index");
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, "r1");
        assert_eq!(records[0].status.as_str(), "failed");

        let Json(detail) = get_run(State(state), Path("r1".to_string()))
            .await
            .expect("detail");
        assert_eq!(detail.manifest.failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn repeated_waits_on_one_step_publish_one_request() {
        let state = state();
        register(&state, "r1").await;
        let (first, second) = tokio::join!(
            mark_waiting(State(state.clone()), Path("r1".to_string()), waiting("deploy", 60)),
            mark_waiting(State(state.clone()), Path("r1".to_string()), waiting("deploy", 60)),
        );
        first.expect("first wait");
        second.expect("second wait");

        let events = events_of(&state, "r1").await;
        let requested = events
            .iter()
            .filter(|e| e.event.event_type == EventType::ApprovalRequested)
            .count();
        assert_eq!(requested, 1);
        assert_eq!(state.approvals.pending().len(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_abandoned_runs_and_their_approvals() {
        let state = state();
        register(&state, "r1").await;
        mark_waiting(State(state.clone()), Path("r1".to_string()), waiting("deploy", 7200))
            .await
            .expect("waiting");
        assert_eq!(state.approvals.pending().len(), 1);
        state.bus.flush().await;

        let now = Utc::now();
        assert!(state.sweep(now + chrono::TimeDelta::seconds(61)).is_empty());
        assert_eq!(
            state.tracker.get("r1").map(|r| r.status),
            Some(TrackedStatus::Stale)
        );

        let evicted = state.sweep(now + chrono::TimeDelta::seconds(3700));
        assert_eq!(evicted, vec!["r1".to_string()]);
        assert!(state.approvals.pending().is_empty());
        let err = get_run(State(state), Path("r1".to_string()))
            .await
            .expect_err("evicted");
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
