//! Shared deterministic types for the build loop.
//!
//! These types are the contracts between the gate runner, the builder and its
//! journal. They carry no I/O and serialize to stable JSON.

use serde::{Deserialize, Serialize};

/// Builder mode. Destructive tools are only reachable in `Execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    Plan,
    Execute,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }
}

/// Outcome of a single verification gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    /// Captured stdout/stderr, bounded by the runner's output limit.
    pub output: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

/// Terminal classification reported by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildOutcome {
    Success,
    Failed,
    Stuck,
}

/// Machine-readable reason attached to a [`BuildOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildReason {
    AllGatesPassed,
    ExecutionError,
    DoomLoop,
    MaxIterations,
    MaxMinutes,
}

/// A failed gate as surfaced in reports and fed back into planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate: String,
    pub output: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl GateFailure {
    /// Longest output kept per failure in reports and prompts.
    pub const OUTPUT_LIMIT: usize = 4_000;

    pub fn from_result(result: &GateResult) -> Self {
        Self {
            gate: result.name.clone(),
            output: truncate_output(&result.output, Self::OUTPUT_LIMIT),
            timed_out: result.timed_out,
        }
    }
}

/// Final structured report of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub build_id: String,
    pub outcome: BuildOutcome,
    pub reason: BuildReason,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub last_failures: Vec<GateFailure>,
    /// Most recent failure fingerprints, oldest first.
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

/// Keep the tail of `output` (where failures usually are) within `limit` bytes.
pub fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut start = output.len() - limit;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated {start} bytes]\n{}", &output[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_the_tail_on_char_boundary() {
        let out = truncate_output("ééééé", 3);
        assert!(out.starts_with("[truncated"));
        assert!(out.ends_with('é'));
        assert_eq!(truncate_output("short", 10), "short");
    }

    #[test]
    fn report_serializes_reason_in_snake_case() {
        let report = BuildReport {
            build_id: "b".to_string(),
            outcome: BuildOutcome::Stuck,
            reason: BuildReason::DoomLoop,
            iterations: 2,
            error: None,
            last_failures: Vec::new(),
            fingerprints: Vec::new(),
        };
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["outcome"], "stuck");
        assert_eq!(value["reason"], "doom_loop");
    }
}
