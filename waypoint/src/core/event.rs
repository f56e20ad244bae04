//! Versioned event envelopes: the unit of truth for runs and builds.
//!
//! Every state change is recorded as an [`Event`] wrapped in an
//! [`EventEnvelope`] and appended to a journal. Manifests and build state are
//! derived by folding these records; nothing else holds authoritative state.
//!
//! Event types are an open set. Types this version does not know about
//! deserialize as [`EventType::Other`] and survive a read/write cycle so newer
//! writers never break older readers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current envelope schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Marker stored in `workflow.failed` payloads written by the reconciler.
pub const CRASHED_REASON: &str = "crashed";

/// Reason recorded in the manifest for a cancelled run.
pub const CANCELLED_REASON: &str = "cancelled";

/// Kind of event. Serialized as its dotted name (`step.completed`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowHeartbeat,
    StepStarted,
    StepCompleted,
    StepFailed,
    ArtifactCreated,
    ApprovalRequested,
    ApprovalReceived,
    BuildStarted,
    BuildModeChanged,
    BuildPlanned,
    BuildGateResult,
    BuildIterationCompleted,
    BuildFinished,
    /// A type written by a newer version; ignored by reducers.
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::WorkflowHeartbeat => "workflow.heartbeat",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::ArtifactCreated => "artifact.created",
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalReceived => "approval.received",
            Self::BuildStarted => "build.started",
            Self::BuildModeChanged => "build.mode_changed",
            Self::BuildPlanned => "build.planned",
            Self::BuildGateResult => "build.gate_result",
            Self::BuildIterationCompleted => "build.iteration_completed",
            Self::BuildFinished => "build.finished",
            Self::Other(name) => name,
        }
    }

    /// Whether this event ends a workflow run.
    pub fn is_workflow_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "workflow.started" => Self::WorkflowStarted,
            "workflow.completed" => Self::WorkflowCompleted,
            "workflow.failed" => Self::WorkflowFailed,
            "workflow.cancelled" => Self::WorkflowCancelled,
            "workflow.heartbeat" => Self::WorkflowHeartbeat,
            "step.started" => Self::StepStarted,
            "step.completed" => Self::StepCompleted,
            "step.failed" => Self::StepFailed,
            "artifact.created" => Self::ArtifactCreated,
            "approval.requested" => Self::ApprovalRequested,
            "approval.received" => Self::ApprovalReceived,
            "build.started" => Self::BuildStarted,
            "build.mode_changed" => Self::BuildModeChanged,
            "build.planned" => Self::BuildPlanned,
            "build.gate_result" => Self::BuildGateResult,
            "build.iteration_completed" => Self::BuildIterationCompleted,
            "build.finished" => Self::BuildFinished,
            _ => Self::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of something that happened in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub run_id: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Build an event stamped with the current time.
    ///
    /// `payload` must serialize to a JSON object (or unit/`null`, which yields an
    /// empty payload).
    pub fn new<P: Serialize>(
        event_type: EventType,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        payload: &P,
    ) -> serde_json::Result<Self> {
        Self::at(Utc::now(), event_type, workflow_id, run_id, payload)
    }

    /// Build an event with an explicit timestamp.
    pub fn at<P: Serialize>(
        timestamp: DateTime<Utc>,
        event_type: EventType,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        payload: &P,
    ) -> serde_json::Result<Self> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self {
            event_type,
            timestamp,
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            payload,
        })
    }

    /// Decode the payload into a typed struct.
    pub fn decode<P: DeserializeOwned>(&self) -> serde_json::Result<P> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

/// Self-describing journal record: `{version, seq, event}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    /// Per-journal sequence number assigned at append time (0-based).
    #[serde(default)]
    pub seq: u64,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(seq: u64, event: Event) -> Self {
        Self {
            version: SCHEMA_VERSION,
            seq,
            event,
        }
    }
}

/// Payload of `workflow.started`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStarted {
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    #[serde(default)]
    pub provenance: Provenance,
}

/// Metadata captured at run start for audit and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub waypoint_version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub extra: std::collections::BTreeMap<String, String>,
}

/// Payload of `workflow.failed` and `workflow.cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailed {
    pub reason: String,
}

/// Payload of `step.started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStarted {
    pub step: String,
}

/// Payload of `step.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompleted {
    pub step: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub duration_ms: u64,
    /// Result replayed from a prior run instead of invoking the step.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

/// Payload of `step.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailed {
    pub step: String,
    pub error: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Payload of `artifact.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCreated {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// Payload of `approval.requested`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequested {
    pub step: String,
    pub prompt: String,
}

/// Payload of `approval.received`. `decision` is `approve`, `reject` or `timed_out`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReceived {
    pub step: String,
    pub decision: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_types_serialize_as_dotted_names() {
        let raw = serde_json::to_string(&EventType::StepCompleted).expect("serialize");
        assert_eq!(raw, "\"step.completed\"");
        let parsed: EventType = serde_json::from_str("\"workflow.failed\"").expect("parse");
        assert_eq!(parsed, EventType::WorkflowFailed);
    }

    #[test]
    fn unknown_types_survive_a_round_trip() {
        let parsed: EventType = serde_json::from_str("\"step.retried\"").expect("parse");
        assert_eq!(parsed, EventType::Other("step.retried".to_string()));
        let raw = serde_json::to_string(&parsed).expect("serialize");
        assert_eq!(raw, "\"step.retried\"");
    }

    #[test]
    fn payload_decodes_into_typed_struct() {
        let event = Event::new(
            EventType::StepCompleted,
            "wf",
            "run-1",
            &StepCompleted {
                step: "fetch".to_string(),
                result: json!({"n": 1}),
                duration_ms: 4,
                cached: false,
            },
        )
        .expect("event");
        assert!(!event.payload.contains_key("cached"));
        let decoded: StepCompleted = event.decode().expect("decode");
        assert_eq!(decoded.step, "fetch");
        assert_eq!(decoded.result, json!({"n": 1}));
    }

    #[test]
    fn envelope_carries_schema_version() {
        let event = Event::new(EventType::WorkflowHeartbeat, "wf", "run-1", &()).expect("event");
        let envelope = EventEnvelope::new(3, event);
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["version"], json!(SCHEMA_VERSION));
        assert_eq!(value["seq"], json!(3));
        assert_eq!(value["event"]["event_type"], json!("workflow.heartbeat"));
        assert_eq!(value["event"]["payload"], json!({}));
    }
}
