//! Bounded plan/execute/verify loop for `waypoint build`.
//!
//! Every transition is journaled under `builds/<build_id>/events.jsonl` before
//! the loop acts on it, and the loop always decides what to do next by asking
//! the folded [`BuildState`]. A resumed build therefore continues from the
//! first undetermined step of its own journal.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::budget::{Budgets, exhausted_budget};
use crate::core::build_state::{
    BuildStarted, BuildState, GateRecorded, IterationCompleted, ModeChanged, NextAction, Planned,
};
use crate::core::event::{Event, EventType};
use crate::core::fingerprint::failure_fingerprint;
use crate::core::types::{BuildMode, BuildOutcome, BuildReason, BuildReport};
use crate::exit_codes;
use crate::io::agent::{ExecRequest, Executor, PlanRequest, Planner, tool_surface};
use crate::io::atomic::write_atomic;
use crate::io::config::{AgentConfig, GateSpec};
use crate::io::gates::{GateRunner, run_all_with};
use crate::io::iteration_log::{BuildPaths, write_gate_log, write_plan};
use crate::io::journal::{Journal, read_journal};
use crate::io::skills::SkillRegistry;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub goal: String,
    /// Gates run after every execution, in this order.
    pub gates: Vec<GateSpec>,
    pub budgets: Budgets,
    /// Process limits for the executor's tool surface.
    pub agent: AgentConfig,
    /// Id for a new build; generated when absent.
    pub build_id: Option<String>,
    /// Continue this build instead of starting a new one. Goal and budgets
    /// then come from its journal.
    pub resume: Option<String>,
    /// Offered to the planner on every iteration.
    pub skills: SkillRegistry,
}

/// The three collaborators a build drives.
pub struct Collaborators<'a> {
    pub planner: &'a dyn Planner,
    pub executor: &'a dyn Executor,
    pub gates: &'a dyn GateRunner,
}

/// `build-<yyyymmddThhmmss>-<6 hex>` in UTC.
pub fn generate_build_id() -> String {
    let suffix: [u8; 3] = rand::random();
    format!(
        "build-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        hex::encode(suffix)
    )
}

/// Fold a build's journal.
pub fn load_build_state(workflow_dir: &Path, build_id: &str) -> Result<BuildState> {
    let paths = BuildPaths::new(workflow_dir, build_id);
    if !paths.events_path.exists() {
        return Err(anyhow!(
            "no build {build_id} under {}",
            workflow_dir.display()
        ));
    }
    let read = read_journal(&paths.events_path)
        .with_context(|| format!("read build journal {}", paths.events_path.display()))?;
    Ok(BuildState::reduce(read.events()))
}

pub fn exit_code_for(outcome: BuildOutcome) -> i32 {
    match outcome {
        BuildOutcome::Success => exit_codes::OK,
        BuildOutcome::Failed => exit_codes::FAILED,
        BuildOutcome::Stuck => exit_codes::STUCK,
    }
}

/// Run (or resume) a build until it succeeds, fails, or exhausts a budget.
///
/// Gate failures feed the next plan; they never end the build by themselves.
/// Only an executor or planner error ends it as `failed`.
#[instrument(skip_all, fields(workflow_dir = %workflow_dir.display()))]
pub fn run_build(
    workflow_dir: &Path,
    options: BuildOptions,
    agents: &Collaborators<'_>,
) -> Result<BuildReport> {
    let mut build = BuildRun::open(workflow_dir, &options)?;
    info!(
        build_id = %build.build_id,
        iteration = build.state.completed_iterations,
        resumed = options.resume.is_some(),
        "build started"
    );

    loop {
        match build.state.next_action() {
            NextAction::Finished(report) => return Ok(report),
            NextAction::Plan { iteration } => {
                if let Some(reason) =
                    exhausted_budget(&build.state, &build.state.budgets, build.elapsed())
                {
                    warn!(build_id = %build.build_id, reason = ?reason, "build stuck");
                    return build.finish(BuildOutcome::Stuck, reason, None);
                }
                build.emit(
                    EventType::BuildModeChanged,
                    &ModeChanged {
                        iteration,
                        mode: BuildMode::Plan,
                    },
                )?;
                let request = PlanRequest {
                    build_id: build.build_id.clone(),
                    iteration,
                    goal: build.state.goal.clone(),
                    workflow_dir: build.workflow_dir.clone(),
                    gates: build.state.gates.clone(),
                    last_failures: build.state.last_failures.clone(),
                    previous_plan: build.state.previous_plan.clone(),
                    skills: options.skills.all().to_vec(),
                };
                let plan = match agents.planner.plan(&request) {
                    Ok(plan) => plan,
                    Err(err) => {
                        return build.finish(
                            BuildOutcome::Failed,
                            BuildReason::ExecutionError,
                            Some(format!("planning failed: {err:#}")),
                        );
                    }
                };
                write_plan(&build.paths, iteration, &plan)?;
                build.emit(EventType::BuildPlanned, &Planned { iteration, plan })?;
            }
            NextAction::Execute { iteration, plan } => {
                build.emit(
                    EventType::BuildModeChanged,
                    &ModeChanged {
                        iteration,
                        mode: BuildMode::Execute,
                    },
                )?;
                let request = ExecRequest {
                    build_id: build.build_id.clone(),
                    iteration,
                    goal: build.state.goal.clone(),
                    workflow_dir: build.workflow_dir.clone(),
                    plan,
                };
                let tools = tool_surface(BuildMode::Execute, &build.workflow_dir, &options.agent);
                if let Err(err) = agents.executor.execute(&request, &tools) {
                    return build.finish(
                        BuildOutcome::Failed,
                        BuildReason::ExecutionError,
                        Some(format!("execution failed: {err:#}")),
                    );
                }

                let passed = build.verify(iteration, &options.gates, agents.gates)?;
                if passed {
                    return build.finish(BuildOutcome::Success, BuildReason::AllGatesPassed, None);
                }
            }
        }
    }
}

struct BuildRun {
    build_id: String,
    workflow_id: String,
    workflow_dir: PathBuf,
    paths: BuildPaths,
    journal: Journal,
    state: BuildState,
    /// Active time carried over from earlier sessions of this build.
    carried: Duration,
    session: Instant,
}

impl BuildRun {
    fn open(workflow_dir: &Path, options: &BuildOptions) -> Result<Self> {
        let workflow_id = workflow_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("workflow dir {} has no name", workflow_dir.display()))?;

        let (build_id, state) = match &options.resume {
            Some(build_id) => (build_id.clone(), load_build_state(workflow_dir, build_id)?),
            None => (
                options.build_id.clone().unwrap_or_else(generate_build_id),
                BuildState::default(),
            ),
        };
        let paths = BuildPaths::new(workflow_dir, &build_id);
        if options.resume.is_none() && paths.events_path.exists() {
            return Err(anyhow!("build {build_id} already exists; use --resume"));
        }
        let journal = Journal::open(&paths.events_path)?;
        let mut build = Self {
            build_id,
            workflow_id,
            workflow_dir: workflow_dir.to_path_buf(),
            paths,
            journal,
            carried: state.elapsed,
            state,
            session: Instant::now(),
        };

        if options.resume.is_none() {
            if options.goal.trim().is_empty() {
                return Err(anyhow!("build goal is empty"));
            }
            build.emit(
                EventType::BuildStarted,
                &BuildStarted {
                    goal: options.goal.clone(),
                    budgets: options.budgets,
                    gates: options.gates.iter().map(|g| g.name.clone()).collect(),
                },
            )?;
        }
        Ok(build)
    }

    fn elapsed(&self) -> Duration {
        self.carried + self.session.elapsed()
    }

    /// Run every gate in order, journal each result, and close the iteration.
    fn verify(&mut self, iteration: u32, gates: &[GateSpec], runner: &dyn GateRunner) -> Result<bool> {
        let workflow_dir = self.workflow_dir.clone();
        let results = run_all_with(runner, gates, &workflow_dir, |result| {
            write_gate_log(&self.paths, iteration, result)?;
            self.emit(
                EventType::BuildGateResult,
                &GateRecorded {
                    iteration,
                    result: result.clone(),
                },
            )
        })?;

        let fingerprint = failure_fingerprint(&results);
        let passed = fingerprint.is_none();
        info!(
            build_id = %self.build_id,
            iteration,
            passed,
            failed = results.iter().filter(|r| !r.passed).count(),
            "iteration verified"
        );
        self.emit(
            EventType::BuildIterationCompleted,
            &IterationCompleted {
                iteration,
                passed,
                fingerprint,
                elapsed_ms: self.elapsed().as_millis() as u64,
            },
        )?;
        Ok(passed)
    }

    fn finish(
        &mut self,
        outcome: BuildOutcome,
        reason: BuildReason,
        error: Option<String>,
    ) -> Result<BuildReport> {
        let report = BuildReport {
            build_id: self.build_id.clone(),
            outcome,
            reason,
            iterations: self.state.iteration,
            error,
            last_failures: self.state.last_failures.clone(),
            fingerprints: self.state.fingerprints.clone(),
        };
        self.emit(EventType::BuildFinished, &report)?;
        let mut buf = serde_json::to_string_pretty(&report).context("serialize build report")?;
        buf.push('\n');
        write_atomic(&self.paths.report_path, &buf)?;
        info!(
            build_id = %self.build_id,
            outcome = ?outcome,
            reason = ?reason,
            iterations = report.iterations,
            "build finished"
        );
        Ok(report)
    }

    fn emit<P: Serialize>(&mut self, event_type: EventType, payload: &P) -> Result<()> {
        let event = Event::new(
            event_type,
            self.workflow_id.as_str(),
            self.build_id.as_str(),
            payload,
        )
        .context("build event")?;
        let envelope = self.journal.append(event)?;
        self.state.apply(&envelope.event);
        Ok(())
    }
}
