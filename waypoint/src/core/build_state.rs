//! Build state reconstructed from the builder's own event stream.
//!
//! The builder never persists [`BuildState`] directly. It appends `build.*`
//! events and folds them with [`BuildState::apply`], the same function a
//! resumed build uses to pick up where the last process stopped.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::budget::Budgets;
use crate::core::event::{Event, EventType};
use crate::core::types::{BuildMode, BuildReport, GateFailure, GateResult};

/// Payload of `build.started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStarted {
    pub goal: String,
    pub budgets: Budgets,
    pub gates: Vec<String>,
}

/// Payload of `build.mode_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChanged {
    pub iteration: u32,
    pub mode: BuildMode,
}

/// Payload of `build.planned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Planned {
    pub iteration: u32,
    pub plan: String,
}

/// Payload of `build.gate_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecorded {
    pub iteration: u32,
    pub result: GateResult,
}

/// Payload of `build.iteration_completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationCompleted {
    pub iteration: u32,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Active build time accumulated so far, across resumes.
    pub elapsed_ms: u64,
}

/// What a build should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Plan { iteration: u32 },
    Execute { iteration: u32, plan: String },
    Finished(BuildReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    pub build_id: String,
    pub goal: String,
    pub budgets: Budgets,
    pub gates: Vec<String>,
    /// Latest iteration that has started (1-indexed, 0 before the first).
    pub iteration: u32,
    pub completed_iterations: u32,
    pub mode: Option<BuildMode>,
    /// Plan for the current iteration once planning has finished.
    pub active_plan: Option<String>,
    /// Plan of the most recently completed iteration.
    pub previous_plan: Option<String>,
    /// Gate results recorded for the current iteration.
    pub gate_results: Vec<GateResult>,
    /// Failures of the most recently completed iteration.
    pub last_failures: Vec<GateFailure>,
    /// Recent failure fingerprints, oldest first.
    pub fingerprints: Vec<String>,
    /// Length of the current run of identical failure fingerprints.
    pub consecutive_identical: u32,
    pub elapsed: Duration,
    pub finished: Option<BuildReport>,
}

impl BuildState {
    /// Fingerprints kept for reports.
    pub const HISTORY_LEN: usize = 10;

    /// Rebuild state by folding the build journal.
    pub fn reduce<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut state = Self::default();
        for event in events {
            state.apply(event);
        }
        state
    }

    pub fn apply(&mut self, event: &Event) {
        if self.build_id.is_empty() {
            self.build_id = event.run_id.clone();
        }
        if let Err(err) = self.transition(event) {
            warn!(event_type = %event.event_type, err = %err, "skipping build event with malformed payload");
        }
    }

    fn transition(&mut self, event: &Event) -> serde_json::Result<()> {
        match &event.event_type {
            EventType::BuildStarted => {
                let started: BuildStarted = event.decode()?;
                self.goal = started.goal;
                self.budgets = started.budgets;
                self.gates = started.gates;
            }
            EventType::BuildModeChanged => {
                let changed: ModeChanged = event.decode()?;
                if changed.iteration > self.iteration {
                    self.iteration = changed.iteration;
                    self.active_plan = None;
                }
                self.mode = Some(changed.mode);
                self.gate_results.clear();
            }
            EventType::BuildPlanned => {
                let planned: Planned = event.decode()?;
                if planned.iteration == self.iteration {
                    self.active_plan = Some(planned.plan);
                }
            }
            EventType::BuildGateResult => {
                let recorded: GateRecorded = event.decode()?;
                if recorded.iteration == self.iteration {
                    self.gate_results.push(recorded.result);
                }
            }
            EventType::BuildIterationCompleted => {
                let done: IterationCompleted = event.decode()?;
                self.completed_iterations = self.completed_iterations.max(done.iteration);
                self.elapsed = Duration::from_millis(done.elapsed_ms);
                self.last_failures = self
                    .gate_results
                    .iter()
                    .filter(|r| !r.passed)
                    .map(GateFailure::from_result)
                    .collect();
                match done.fingerprint {
                    Some(fingerprint) if !done.passed => {
                        let repeats = self.fingerprints.last() == Some(&fingerprint);
                        self.consecutive_identical = if repeats {
                            self.consecutive_identical + 1
                        } else {
                            1
                        };
                        self.fingerprints.push(fingerprint);
                        if self.fingerprints.len() > Self::HISTORY_LEN {
                            let excess = self.fingerprints.len() - Self::HISTORY_LEN;
                            self.fingerprints.drain(..excess);
                        }
                    }
                    _ => self.consecutive_identical = 0,
                }
                if let Some(plan) = self.active_plan.take() {
                    self.previous_plan = Some(plan);
                }
            }
            EventType::BuildFinished => {
                let report: BuildReport = event.decode()?;
                self.finished = Some(report);
            }
            _ => {}
        }
        Ok(())
    }

    /// Next undetermined step of the build.
    pub fn next_action(&self) -> NextAction {
        if let Some(report) = &self.finished {
            return NextAction::Finished(report.clone());
        }
        if self.iteration > self.completed_iterations
            && let Some(plan) = &self.active_plan
        {
            return NextAction::Execute {
                iteration: self.iteration,
                plan: plan.clone(),
            };
        }
        NextAction::Plan {
            iteration: self.completed_iterations + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BuildOutcome, BuildReason};

    fn ev<P: Serialize>(event_type: EventType, payload: &P) -> Event {
        Event::new(event_type, "wf", "build-1", payload).expect("event")
    }

    fn iteration(n: u32, passed: bool, fingerprint: Option<&str>) -> Vec<Event> {
        vec![
            ev(
                EventType::BuildModeChanged,
                &ModeChanged {
                    iteration: n,
                    mode: BuildMode::Plan,
                },
            ),
            ev(
                EventType::BuildPlanned,
                &Planned {
                    iteration: n,
                    plan: format!("plan {n}"),
                },
            ),
            ev(
                EventType::BuildModeChanged,
                &ModeChanged {
                    iteration: n,
                    mode: BuildMode::Execute,
                },
            ),
            ev(
                EventType::BuildGateResult,
                &GateRecorded {
                    iteration: n,
                    result: GateResult {
                        name: "validate".to_string(),
                        passed,
                        output: "out".to_string(),
                        duration_ms: 1,
                        timed_out: false,
                    },
                },
            ),
            ev(
                EventType::BuildIterationCompleted,
                &IterationCompleted {
                    iteration: n,
                    passed,
                    fingerprint: fingerprint.map(str::to_string),
                    elapsed_ms: u64::from(n) * 1000,
                },
            ),
        ]
    }

    #[test]
    fn identical_fingerprints_extend_the_streak() {
        let mut events = iteration(1, false, Some("aaa"));
        events.extend(iteration(2, false, Some("aaa")));
        let state = BuildState::reduce(&events);
        assert_eq!(state.completed_iterations, 2);
        assert_eq!(state.consecutive_identical, 2);
        assert_eq!(state.fingerprints, vec!["aaa", "aaa"]);
        assert_eq!(state.last_failures.len(), 1);
        assert_eq!(state.elapsed, Duration::from_secs(2));
    }

    #[test]
    fn different_fingerprint_or_pass_resets_the_streak() {
        let mut events = iteration(1, false, Some("aaa"));
        events.extend(iteration(2, false, Some("bbb")));
        assert_eq!(BuildState::reduce(&events).consecutive_identical, 1);

        events.extend(iteration(3, true, None));
        let state = BuildState::reduce(&events);
        assert_eq!(state.consecutive_identical, 0);
        assert!(state.last_failures.is_empty());
    }

    #[test]
    fn planned_but_unverified_iteration_resumes_at_execute() {
        let mut events = iteration(1, false, Some("aaa"));
        let second = iteration(2, false, Some("aaa"));
        // Crash after the plan of iteration 2 was journaled.
        events.extend(second.into_iter().take(3));
        let state = BuildState::reduce(&events);
        assert_eq!(
            state.next_action(),
            NextAction::Execute {
                iteration: 2,
                plan: "plan 2".to_string()
            }
        );
    }

    #[test]
    fn crash_before_plan_resumes_at_plan() {
        let mut events = iteration(1, false, Some("aaa"));
        events.extend(iteration(2, false, None).into_iter().take(1));
        let state = BuildState::reduce(&events);
        assert_eq!(state.next_action(), NextAction::Plan { iteration: 2 });
    }

    #[test]
    fn finished_build_reports_recorded_outcome() {
        let mut events = iteration(1, true, None);
        let report = BuildReport {
            build_id: "build-1".to_string(),
            outcome: BuildOutcome::Success,
            reason: BuildReason::AllGatesPassed,
            iterations: 1,
            error: None,
            last_failures: Vec::new(),
            fingerprints: Vec::new(),
        };
        events.push(ev(EventType::BuildFinished, &report));
        let state = BuildState::reduce(&events);
        assert_eq!(state.next_action(), NextAction::Finished(report));
    }
}
