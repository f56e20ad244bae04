//! Test-only collaborators and journal fixtures.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

use crate::core::event::{Event, EventType, StepCompleted, StepStarted, WorkflowStarted};
use crate::core::types::GateResult;
use crate::io::agent::{ExecRequest, Executor, PlanRequest, Planner};
use crate::io::config::GateSpec;
use crate::io::gates::GateRunner;
use crate::io::journal::Journal;
use crate::io::layout::{RunPaths, WorkflowsLayout};
use crate::io::run_index::RunIndex;
use crate::io::tools::ToolSurface;

/// A temporary workflows root.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub layout: WorkflowsLayout,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let layout = WorkflowsLayout::new(dir.path());
        Ok(Self { dir, layout })
    }

    pub fn index(&self) -> RunIndex {
        RunIndex::for_layout(&self.layout)
    }
}

/// A gate spec whose command is never spawned by the scripted runner.
pub fn gate(name: &str) -> GateSpec {
    GateSpec {
        name: name.to_string(),
        command: vec!["true".to_string()],
        timeout: Duration::from_secs(5),
    }
}

/// Planner that answers `plan <iteration>` and records every request.
#[derive(Default)]
pub struct ScriptedPlanner {
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    pub fn calls(&self) -> usize {
        self.requests.lock().expect("planner lock").len()
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().expect("planner lock").clone()
    }
}

impl Planner for ScriptedPlanner {
    fn plan(&self, request: &PlanRequest) -> Result<String> {
        self.requests
            .lock()
            .expect("planner lock")
            .push(request.clone());
        Ok(format!("plan {}", request.iteration))
    }
}

/// Executor that records plans, optionally writes a file through the tool
/// surface, or fails with a fixed message.
#[derive(Default)]
pub struct ScriptedExecutor {
    error: Option<String>,
    write: Option<(String, String)>,
    plans: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn writing(rel_path: &str, contents: &str) -> Self {
        Self {
            write: Some((rel_path.to_string(), contents.to_string())),
            ..Self::default()
        }
    }

    pub fn plans(&self) -> Vec<String> {
        self.plans.lock().expect("executor lock").clone()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest, tools: &ToolSurface) -> Result<()> {
        self.plans
            .lock()
            .expect("executor lock")
            .push(request.plan.clone());
        if let Some(message) = &self.error {
            return Err(anyhow!("{message}"));
        }
        if let Some((rel_path, contents)) = &self.write {
            tools.write_file(rel_path, contents)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum GateScript {
    Pass,
    /// The named gate fails `remaining` more times (forever when `None`).
    Fail {
        gate: String,
        remaining: Option<u32>,
        output: String,
    },
}

/// Gate runner with scripted outcomes; never spawns processes.
pub struct ScriptedGateRunner {
    script: Mutex<GateScript>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedGateRunner {
    fn new(script: GateScript) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::default(),
        }
    }

    pub fn passing() -> Self {
        Self::new(GateScript::Pass)
    }

    pub fn always_failing(gate: &str, output: &str) -> Self {
        Self::new(GateScript::Fail {
            gate: gate.to_string(),
            remaining: None,
            output: output.to_string(),
        })
    }

    pub fn failing_times(gate: &str, times: u32, output: &str) -> Self {
        Self::new(GateScript::Fail {
            gate: gate.to_string(),
            remaining: Some(times),
            output: output.to_string(),
        })
    }

    /// Total gate invocations.
    pub fn calls(&self) -> u32 {
        self.calls.lock().expect("calls lock").values().sum()
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run(&self, gate: &GateSpec, _workflow_dir: &Path) -> Result<GateResult> {
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(gate.name.clone())
            .or_default() += 1;

        let mut script = self.script.lock().expect("script lock");
        let failure = match &mut *script {
            GateScript::Fail {
                gate: failing,
                remaining,
                output,
            } if *failing == gate.name && remaining.is_none_or(|n| n > 0) => {
                if let Some(n) = remaining {
                    *n -= 1;
                }
                Some(output.clone())
            }
            _ => None,
        };
        Ok(GateResult {
            name: gate.name.clone(),
            passed: failure.is_none(),
            output: failure.unwrap_or_else(|| "ok".to_string()),
            duration_ms: 1,
            timed_out: false,
        })
    }
}

/// Append events to a run's journal as an interrupted process would have.
pub fn write_events(run: &RunPaths, events: &[Event]) -> Result<()> {
    let mut journal = Journal::open(&run.events_path)?;
    for event in events {
        journal.append(event.clone())?;
    }
    Ok(())
}

pub fn workflow_started(run: &RunPaths, params: Map<String, Value>) -> Event {
    Event::new(
        EventType::WorkflowStarted,
        run.workflow_id.as_str(),
        run.run_id.as_str(),
        &WorkflowStarted {
            params,
            ..WorkflowStarted::default()
        },
    )
    .expect("workflow.started event")
}

pub fn step_started(run: &RunPaths, step: &str) -> Event {
    Event::new(
        EventType::StepStarted,
        run.workflow_id.as_str(),
        run.run_id.as_str(),
        &StepStarted {
            step: step.to_string(),
        },
    )
    .expect("step.started event")
}

pub fn step_completed(run: &RunPaths, step: &str, result: Value) -> Event {
    Event::new(
        EventType::StepCompleted,
        run.workflow_id.as_str(),
        run.run_id.as_str(),
        &StepCompleted {
            step: step.to_string(),
            result,
            duration_ms: 1,
            cached: false,
        },
    )
    .expect("step.completed event")
}

pub fn workflow_completed(run: &RunPaths) -> Event {
    Event::new(
        EventType::WorkflowCompleted,
        run.workflow_id.as_str(),
        run.run_id.as_str(),
        &json!({}),
    )
    .expect("workflow.completed event")
}
