//! Event-sourced run manifest.
//!
//! [`reduce`] folds a journal into a [`Manifest`] in journal order. Each event
//! type has its own transition; unknown types and malformed payloads are
//! skipped so a journal written by a newer version still folds. The fold is
//! deterministic: the same journal always yields an identical manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::event::{
    ApprovalReceived, ApprovalRequested, ArtifactCreated, CANCELLED_REASON, CRASHED_REASON, Event,
    EventType, Provenance, StepCompleted, StepFailed, StepStarted, WorkflowFailed,
    WorkflowStarted,
};

/// Run status surfaced to users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Success,
    Failed,
    Crashed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "crashed" => Ok(Self::Crashed),
            other => Err(anyhow::anyhow!(
                "unknown run status '{other}' (expected running|success|failed|crashed)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Result was replayed from the run this one resumed from.
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub step: String,
    pub prompt: String,
    /// `approve`, `reject`, `timed_out`, or `None` while still pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

/// Point-in-time summary of a run, rebuilt from its journal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub workflow_id: String,
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Operator-supplied reason of a cancelled run. `failure_reason` stays
    /// `cancelled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    #[serde(default)]
    pub provenance: Provenance,
    /// Number of events folded into this manifest.
    #[serde(default)]
    pub event_count: u64,
}

impl Manifest {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().rev().find(|step| step.name == name)
    }

    /// Successful step results keyed by name, used to skip work on resume.
    pub fn successful_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Success)
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().rev().find(|step| step.name == name)
    }

    fn terminate(&mut self, status: RunStatus, at: DateTime<Utc>, reason: Option<String>) {
        // Terminal states are absorbing: a late duplicate terminal cannot move the status.
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.ended_at = Some(at);
        self.failure_reason = reason;
    }
}

/// Fold journal events into a manifest.
pub fn reduce<'a, I>(events: I) -> Manifest
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut manifest = Manifest::default();
    for event in events {
        apply(&mut manifest, event);
    }
    manifest
}

/// Apply one event to the manifest.
pub fn apply(manifest: &mut Manifest, event: &Event) {
    if manifest.workflow_id.is_empty() {
        manifest.workflow_id = event.workflow_id.clone();
    }
    if manifest.run_id.is_empty() {
        manifest.run_id = event.run_id.clone();
    }
    manifest.event_count += 1;
    manifest.last_event_at = Some(match manifest.last_event_at {
        Some(prev) if prev > event.timestamp => prev,
        _ => event.timestamp,
    });

    if let Err(err) = transition(manifest, event) {
        warn!(event_type = %event.event_type, err = %err, "skipping event with malformed payload");
    }
}

fn transition(m: &mut Manifest, event: &Event) -> serde_json::Result<()> {
    let at = event.timestamp;
    match &event.event_type {
        EventType::WorkflowStarted => {
            let started: WorkflowStarted = event.decode()?;
            m.params = started.params;
            m.resumed_from = started.resumed_from;
            m.provenance = started.provenance;
            m.started_at.get_or_insert(at);
        }
        EventType::StepStarted => {
            let started: StepStarted = event.decode()?;
            m.steps.push(StepResult {
                name: started.step,
                status: StepStatus::Pending,
                result: None,
                error: None,
                started_at: at,
                ended_at: None,
                duration_ms: None,
                cached: false,
            });
        }
        EventType::StepCompleted => {
            let done: StepCompleted = event.decode()?;
            let step = pending_or_insert(m, &done.step, at);
            step.status = StepStatus::Success;
            step.result = Some(done.result);
            step.error = None;
            step.ended_at = Some(at);
            step.duration_ms = Some(done.duration_ms);
            step.cached = done.cached;
        }
        EventType::StepFailed => {
            let failed: StepFailed = event.decode()?;
            let step = pending_or_insert(m, &failed.step, at);
            step.status = StepStatus::Failed;
            step.error = Some(failed.error);
            step.ended_at = Some(at);
            step.duration_ms = Some(failed.duration_ms);
        }
        EventType::ArtifactCreated => {
            let artifact: ArtifactCreated = event.decode()?;
            m.artifacts.push(Artifact {
                name: artifact.name,
                path: artifact.path,
                step: artifact.step,
                created_at: at,
            });
        }
        EventType::ApprovalRequested => {
            let requested: ApprovalRequested = event.decode()?;
            m.approvals.push(ApprovalRecord {
                step: requested.step,
                prompt: requested.prompt,
                decision: None,
            });
        }
        EventType::ApprovalReceived => {
            let received: ApprovalReceived = event.decode()?;
            match m
                .approvals
                .iter_mut()
                .rev()
                .find(|a| a.step == received.step && a.decision.is_none())
            {
                Some(record) => record.decision = Some(received.decision),
                None => m.approvals.push(ApprovalRecord {
                    step: received.step,
                    prompt: String::new(),
                    decision: Some(received.decision),
                }),
            }
        }
        EventType::WorkflowCompleted => m.terminate(RunStatus::Success, at, None),
        EventType::WorkflowFailed => {
            let failed: WorkflowFailed = event.decode()?;
            let status = if failed.reason == CRASHED_REASON {
                RunStatus::Crashed
            } else {
                RunStatus::Failed
            };
            m.terminate(status, at, Some(failed.reason));
        }
        EventType::WorkflowCancelled => {
            if !m.status.is_terminal() {
                // The payload is optional.
                m.cancel_reason = event
                    .decode::<WorkflowFailed>()
                    .ok()
                    .map(|cancelled| cancelled.reason)
                    .filter(|reason| !reason.trim().is_empty());
            }
            m.terminate(RunStatus::Failed, at, Some(CANCELLED_REASON.to_string()));
        }
        // Liveness only; last_event_at was already advanced.
        EventType::WorkflowHeartbeat => {}
        EventType::BuildStarted
        | EventType::BuildModeChanged
        | EventType::BuildPlanned
        | EventType::BuildGateResult
        | EventType::BuildIterationCompleted
        | EventType::BuildFinished
        | EventType::Other(_) => {}
    }
    Ok(())
}

/// Find the latest pending attempt of `name`, or record one that was never
/// announced with `step.started`.
fn pending_or_insert<'a>(m: &'a mut Manifest, name: &str, at: DateTime<Utc>) -> &'a mut StepResult {
    let has_pending = m
        .step(name)
        .is_some_and(|step| step.status == StepStatus::Pending);
    if !has_pending {
        m.steps.push(StepResult {
            name: name.to_string(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: at,
            ended_at: None,
            duration_ms: None,
            cached: false,
        });
    }
    // A matching step exists on both paths.
    let idx = m
        .steps
        .iter()
        .rposition(|step| step.name == name)
        .unwrap_or(m.steps.len() - 1);
    &mut m.steps[idx]
}
