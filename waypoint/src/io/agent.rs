//! Planner and executor collaborators of the build loop.
//!
//! The [`Planner`] and [`Executor`] traits decouple the loop from the agent
//! backend. [`CommandAgent`] implements both by spawning the configured agent
//! command with a rendered prompt on stdin. Tests use scripted collaborators
//! that never spawn processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::policy::ToolOp;
use crate::core::types::{BuildMode, GateFailure, truncate_output};
use crate::io::config::AgentConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::prompt::{DEFAULT_BUDGET_BYTES, render_execute_prompt, render_plan_prompt};
use crate::io::skills::Skill;
use crate::io::tools::ToolSurface;

/// Inputs to one planning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub build_id: String,
    pub iteration: u32,
    pub goal: String,
    pub workflow_dir: PathBuf,
    pub gates: Vec<String>,
    /// Failures of the previous iteration, fed back as context.
    pub last_failures: Vec<GateFailure>,
    pub previous_plan: Option<String>,
    /// Skills the planner may consult.
    pub skills: Vec<Skill>,
}

/// Inputs to one execution step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub build_id: String,
    pub iteration: u32,
    pub goal: String,
    pub workflow_dir: PathBuf,
    pub plan: String,
}

/// Produces the plan text for an iteration. Has no access to destructive tools.
pub trait Planner {
    fn plan(&self, request: &PlanRequest) -> Result<String>;
}

/// Applies a plan through the tool surface it is handed.
pub trait Executor {
    fn execute(&self, request: &ExecRequest, tools: &ToolSurface) -> Result<()>;
}

/// Agent backed by an external command (`agent.command` in `waypoint.toml`).
#[derive(Debug, Clone)]
pub struct CommandAgent {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
    /// Directory for per-call agent logs; `None` disables them.
    pub log_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            output_limit_bytes: config.output_limit_bytes,
            prompt_budget_bytes: DEFAULT_BUDGET_BYTES,
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }

    fn check(&self, label: &str, output: &CommandOutput) -> Result<()> {
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "{label} agent timed out");
            return Err(anyhow!("{label} agent timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "{label} agent failed");
            return Err(anyhow!(
                "{label} agent failed with status {:?}: {}",
                output.status.code(),
                truncate_output(String::from_utf8_lossy(&output.stderr).trim(), 2_000)
            ));
        }
        Ok(())
    }

    fn write_log(&self, name: &str, prompt: &str, output: &CommandOutput) -> Result<()> {
        let Some(dir) = &self.log_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir).with_context(|| format!("create agent log dir {}", dir.display()))?;
        let path = dir.join(format!("{name}.log"));
        let mut buf = String::new();
        buf.push_str("=== prompt ===\n");
        buf.push_str(prompt);
        buf.push_str("\n=== output ===\n");
        buf.push_str(&output.combined("agent"));
        if output.timed_out {
            buf.push_str("\n[agent timed out]\n");
        }
        fs::write(&path, buf).with_context(|| format!("write agent log {}", path.display()))
    }
}

impl Planner for CommandAgent {
    #[instrument(skip_all, fields(iteration = request.iteration))]
    fn plan(&self, request: &PlanRequest) -> Result<String> {
        let prompt = render_plan_prompt(request, self.prompt_budget_bytes)?;
        info!(workdir = %request.workflow_dir.display(), "running planner agent");
        let mut cmd = self.command()?;
        cmd.current_dir(&request.workflow_dir);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run planner agent")?;
        self.write_log(&format!("plan-{}", request.iteration), &prompt, &output)?;
        self.check("planner", &output)?;

        let plan = output.stdout_text().trim().to_string();
        if plan.is_empty() {
            return Err(anyhow!("planner agent returned an empty plan"));
        }
        debug!(bytes = plan.len(), "plan received");
        Ok(plan)
    }
}

impl Executor for CommandAgent {
    #[instrument(skip_all, fields(iteration = request.iteration, mode = tools.mode().as_str()))]
    fn execute(&self, request: &ExecRequest, tools: &ToolSurface) -> Result<()> {
        // The agent process edits the workspace, so it needs EXECUTE rights.
        tools.authorize(ToolOp::RunShell)?;
        let prompt = render_execute_prompt(request, self.prompt_budget_bytes)?;
        info!(workdir = %tools.root().display(), "running executor agent");
        let output = tools
            .run_command(self.command()?, Some(prompt.as_bytes()))
            .context("run executor agent")?;
        self.write_log(&format!("execute-{}", request.iteration), &prompt, &output)?;
        self.check("executor", &output)?;
        debug!("executor agent completed");
        Ok(())
    }
}

/// Surface for an executor in `mode`, rooted at `workflow_dir`, with the
/// agent's process limits.
pub fn tool_surface(mode: BuildMode, workflow_dir: &Path, config: &AgentConfig) -> ToolSurface {
    ToolSurface::new(mode, workflow_dir).with_shell_limits(
        Duration::from_secs(config.timeout_seconds),
        config.output_limit_bytes,
    )
}
