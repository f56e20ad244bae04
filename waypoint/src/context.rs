//! Workflow execution context: runs steps and journals what happened.
//!
//! A [`WorkflowContext`] owns the journal of one run. Every step invocation is
//! bracketed by `step.started` and `step.completed`/`step.failed`, and the
//! in-memory manifest is folded from exactly the events that were appended.
//!
//! When started with `resume_from`, steps that succeeded in the source run are
//! not invoked again: their recorded result is replayed as a cached
//! `step.completed`. The context never retries a step itself.
//!
//! Dropping a context without finalizing leaves the run non-terminal on disk,
//! which is what the reconciler later detects as a crash.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalError, ApprovalRegistry, Decision, TIMED_OUT};
use crate::bus::EventSink;
use crate::core::event::{
    ApprovalReceived, ApprovalRequested, ArtifactCreated, Event, EventType, StepCompleted,
    StepFailed, StepStarted, WorkflowFailed, WorkflowStarted,
};
use crate::core::manifest::{self, Manifest, RunStatus, StepStatus};
use crate::io::journal::Journal;
use crate::io::layout::{RunPaths, WorkflowsLayout};
use crate::io::manifest_store::{load_manifest, refresh_manifest, write_manifest};
use crate::io::provenance;
use crate::io::run_index::{RunIndex, RunRecord};
use crate::io::tools::join_within;

/// What a failing step does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Fail the run and return the error to the caller.
    #[default]
    FailFast,
    /// Record the failure and keep going; `record_step` returns `null`.
    Continue,
}

/// A step failed and the run was aborted under [`FailurePolicy::FailFast`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("step '{step}' failed")]
pub struct StepError {
    pub step: String,
}

#[derive(Default)]
pub struct StartOptions {
    /// Replay successful steps of this earlier run of the same workflow.
    pub resume_from: Option<String>,
    pub failure_policy: FailurePolicy,
    /// Receives every journaled event after it is durable.
    pub sink: Option<Arc<dyn EventSink>>,
    /// Records the run when it starts and when it ends.
    pub index: Option<RunIndex>,
    /// Use this run id instead of generating one.
    pub run_id: Option<String>,
    pub provenance_extra: BTreeMap<String, String>,
}

pub struct WorkflowContext {
    paths: RunPaths,
    journal: Journal,
    manifest: Manifest,
    cached: HashMap<String, Value>,
    policy: FailurePolicy,
    sink: Option<Arc<dyn EventSink>>,
    index: Option<RunIndex>,
}

/// `run-<yyyymmddThhmmss>-<6 hex>` in UTC.
pub fn generate_run_id() -> String {
    let suffix: [u8; 3] = rand::random();
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        hex::encode(suffix)
    )
}

impl WorkflowContext {
    /// Create the run directory, journal `workflow.started`, and return the context.
    pub fn start(
        layout: &WorkflowsLayout,
        workflow_id: &str,
        params: Map<String, Value>,
        options: StartOptions,
    ) -> Result<Self> {
        let run_id = options.run_id.unwrap_or_else(generate_run_id);
        let paths = layout.run(workflow_id, &run_id);
        if paths.events_path.exists() {
            return Err(anyhow!(
                "run {run_id} of workflow {workflow_id} already exists at {}",
                paths.dir.display()
            ));
        }

        let cached = match &options.resume_from {
            Some(source) => load_resume_source(layout, workflow_id, source)?,
            None => HashMap::new(),
        };

        paths.create_dirs()?;
        let journal = Journal::open(&paths.events_path)?;
        let mut ctx = Self {
            paths,
            journal,
            manifest: Manifest::default(),
            cached,
            policy: options.failure_policy,
            sink: options.sink,
            index: options.index,
        };

        let started = WorkflowStarted {
            params,
            resumed_from: options.resume_from,
            provenance: provenance::capture(None, options.provenance_extra),
        };
        ctx.emit(EventType::WorkflowStarted, &started)?;
        ctx.record_index()?;
        info!(
            workflow_id,
            run_id = %ctx.paths.run_id,
            resumed_from = ?started.resumed_from,
            cached_steps = ctx.cached.len(),
            "run started"
        );
        Ok(ctx)
    }

    pub fn run_id(&self) -> &str {
        &self.paths.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.paths.workflow_id
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Current state, folded from the events journaled so far.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_finished(&self) -> bool {
        self.manifest.status.is_terminal()
    }

    /// Run one step, or replay its result if the resume source already
    /// completed it.
    pub fn record_step<F>(&mut self, name: &str, step: F) -> Result<Value>
    where
        F: FnOnce() -> Result<Value>,
    {
        self.ensure_running()?;
        if let Some(result) = self.cached.get(name).cloned() {
            debug!(step = name, "replaying cached step result");
            self.emit(
                EventType::StepCompleted,
                &StepCompleted {
                    step: name.to_string(),
                    result: result.clone(),
                    duration_ms: 0,
                    cached: true,
                },
            )?;
            return Ok(result);
        }

        self.emit(
            EventType::StepStarted,
            &StepStarted {
                step: name.to_string(),
            },
        )?;
        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(step)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(anyhow!("step panicked: {}", panic_text(payload.as_ref()))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.emit(
                    EventType::StepCompleted,
                    &StepCompleted {
                        step: name.to_string(),
                        result: result.clone(),
                        duration_ms,
                        cached: false,
                    },
                )?;
                debug!(step = name, duration_ms, "step completed");
                Ok(result)
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(step = name, err = %message, "step failed");
                self.emit(
                    EventType::StepFailed,
                    &StepFailed {
                        step: name.to_string(),
                        error: message.clone(),
                        duration_ms,
                    },
                )?;
                match self.policy {
                    FailurePolicy::Continue => Ok(Value::Null),
                    FailurePolicy::FailFast => {
                        self.fail(&format!("step '{name}' failed: {message}"))?;
                        Err(err.context(StepError {
                            step: name.to_string(),
                        }))
                    }
                }
            }
        }
    }

    /// Record a file under the run's `results/` directory as an artifact.
    /// Returns the absolute path to write to. Paths that would leave
    /// `results/` are refused and nothing is journaled.
    pub fn artifact(&mut self, name: &str, rel_path: &str, step: Option<&str>) -> Result<PathBuf> {
        self.ensure_running()?;
        let path = join_within(&self.paths.results_dir, rel_path)
            .with_context(|| format!("artifact '{name}'"))?;
        self.emit(
            EventType::ArtifactCreated,
            &ArtifactCreated {
                name: name.to_string(),
                path: rel_path.to_string(),
                step: step.map(str::to_string),
            },
        )?;
        Ok(path)
    }

    /// Append a line to the run's `output.log`.
    pub fn log(&self, line: &str) -> Result<()> {
        let path = &self.paths.output_log_path;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line.trim_end())
            .with_context(|| format!("append {}", path.display()))
    }

    /// Record liveness for the reconciler and the daemon.
    pub fn heartbeat(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.emit(EventType::WorkflowHeartbeat, &())
    }

    /// Journal an approval request and block until it is decided.
    ///
    /// A timeout is journaled as `timed_out` and returned as
    /// [`ApprovalError::Timeout`], distinct from a rejection.
    pub fn request_approval(
        &mut self,
        registry: &ApprovalRegistry,
        step: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Decision> {
        self.ensure_running()?;
        self.emit(
            EventType::ApprovalRequested,
            &ApprovalRequested {
                step: step.to_string(),
                prompt: prompt.to_string(),
            },
        )?;
        let handle = registry.request(self.run_id(), step, prompt);
        let result = registry.await_decision(&handle, timeout);
        let decision = match &result {
            Ok(decision) => decision.as_str(),
            Err(ApprovalError::Timeout { .. }) => TIMED_OUT,
            Err(err) => return Err(err.clone().into()),
        };
        self.emit(
            EventType::ApprovalReceived,
            &ApprovalReceived {
                step: step.to_string(),
                decision: decision.to_string(),
            },
        )?;
        result.map_err(Into::into)
    }

    /// Journal the terminal event for `status` and return the final manifest.
    ///
    /// Finalizing a run that already ended returns its manifest unchanged.
    pub fn finalize(&mut self, status: RunStatus) -> Result<Manifest> {
        match status {
            RunStatus::Success => self.complete(),
            RunStatus::Failed => self.fail("failed"),
            RunStatus::Running | RunStatus::Crashed => Err(anyhow!(
                "cannot finalize a run as {}",
                status.as_str()
            )),
        }
    }

    /// Success unless any step's latest attempt failed.
    pub fn finish(&mut self) -> Result<Manifest> {
        let failed: Vec<String> = latest_attempts(&self.manifest)
            .filter(|step| step.status == StepStatus::Failed)
            .map(|step| step.name.clone())
            .collect();
        if failed.is_empty() {
            self.complete()
        } else {
            self.fail(&format!("steps failed: {}", failed.join(", ")))
        }
    }

    pub fn complete(&mut self) -> Result<Manifest> {
        if !self.is_finished() {
            self.emit(EventType::WorkflowCompleted, &())?;
            self.after_terminal()?;
        }
        Ok(self.manifest.clone())
    }

    pub fn fail(&mut self, reason: &str) -> Result<Manifest> {
        if !self.is_finished() {
            self.emit(
                EventType::WorkflowFailed,
                &WorkflowFailed {
                    reason: reason.to_string(),
                },
            )?;
            self.after_terminal()?;
        }
        Ok(self.manifest.clone())
    }

    fn after_terminal(&mut self) -> Result<()> {
        write_manifest(&self.paths.manifest_path, &self.manifest)?;
        self.record_index()?;
        info!(
            run_id = %self.paths.run_id,
            status = self.manifest.status.as_str(),
            "run finished"
        );
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_finished() {
            return Err(anyhow!(
                "run {} already ended with status {}",
                self.paths.run_id,
                self.manifest.status.as_str()
            ));
        }
        Ok(())
    }

    fn record_index(&self) -> Result<()> {
        if let Some(index) = &self.index {
            index.record(&RunRecord::from_manifest(&self.manifest))?;
        }
        Ok(())
    }

    /// Durably journal an event, fold it, then publish it.
    fn emit<P: Serialize>(&mut self, event_type: EventType, payload: &P) -> Result<()> {
        let event = Event::new(
            event_type,
            self.paths.workflow_id.as_str(),
            self.paths.run_id.as_str(),
            payload,
        )
        .context("build event")?;
        let envelope = self.journal.append(event)?;
        manifest::apply(&mut self.manifest, &envelope.event);
        if let Some(sink) = &self.sink {
            sink.emit(&envelope.event);
        }
        Ok(())
    }
}

/// Successful step results of the run being resumed, latest attempt per name.
fn load_resume_source(
    layout: &WorkflowsLayout,
    workflow_id: &str,
    source_run: &str,
) -> Result<HashMap<String, Value>> {
    let source = layout.run(workflow_id, source_run);
    if !source.events_path.exists() {
        return Err(anyhow!(
            "cannot resume from {source_run}: no journal at {}",
            source.events_path.display()
        ));
    }
    let manifest = load_manifest(&source)?;
    Ok(latest_attempts(&manifest)
        .filter(|step| step.status == StepStatus::Success)
        .map(|step| (step.name.clone(), step.result.clone().unwrap_or(Value::Null)))
        .collect())
}

fn latest_attempts(manifest: &Manifest) -> impl Iterator<Item = &manifest::StepResult> {
    manifest
        .steps
        .iter()
        .enumerate()
        .filter(|(idx, step)| {
            !manifest.steps[idx + 1..]
                .iter()
                .any(|later| later.name == step.name)
        })
        .map(|(_, step)| step)
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Append `workflow.cancelled` to a run that has not ended.
///
/// Returns the updated manifest, or `None` when the run was already terminal.
pub fn cancel(
    layout: &WorkflowsLayout,
    workflow_id: &str,
    run_id: &str,
    reason: &str,
    index: Option<&RunIndex>,
) -> Result<Option<Manifest>> {
    let run = layout.run(workflow_id, run_id);
    if !run.events_path.exists() {
        return Err(anyhow!(
            "no run {run_id} for workflow {workflow_id} at {}",
            run.dir.display()
        ));
    }
    let current = load_manifest(&run)?;
    if current.status.is_terminal() {
        debug!(run_id, status = current.status.as_str(), "cancel ignored for ended run");
        return Ok(None);
    }
    let event = Event::new(
        EventType::WorkflowCancelled,
        workflow_id,
        run_id,
        &WorkflowFailed {
            reason: reason.to_string(),
        },
    )
    .context("build cancel event")?;
    Journal::open(&run.events_path)?.append(event)?;
    let manifest = refresh_manifest(&run)?;
    if let Some(index) = index {
        index.record(&RunRecord::from_manifest(&manifest))?;
    }
    info!(run_id, reason, "run cancelled");
    Ok(Some(manifest))
}
