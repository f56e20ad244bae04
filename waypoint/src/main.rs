//! Durable workflow runs and the agentic build loop.
//!
//! Commands print machine-readable JSON on stdout; diagnostics go to stderr.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;

use waypoint::build::{
    BuildOptions, Collaborators, exit_code_for, generate_build_id, load_build_state, run_build,
};
use waypoint::context::cancel;
use waypoint::core::manifest::RunStatus;
use waypoint::exit_codes;
use waypoint::io::agent::CommandAgent;
use waypoint::io::config::{GateSpec, WaypointConfig, load_config, write_config};
use waypoint::io::gates::CommandGateRunner;
use waypoint::io::iteration_log::BuildPaths;
use waypoint::io::layout::WorkflowsLayout;
use waypoint::io::manifest_store::{load_manifest, refresh_manifest};
use waypoint::io::run_index::{RunFilter, RunIndex};
use waypoint::io::skills::SkillRegistry;
use waypoint::logging;
use waypoint::reconcile::scan_and_reconcile;

#[derive(Parser)]
#[command(
    name = "waypoint",
    version,
    about = "Durable workflow runs and a bounded plan/execute/verify build loop"
)]
struct Cli {
    /// Workflows root holding `<workflow>/runs/<run>/` and `index.jsonl`.
    #[arg(long, global = true, default_value = "workflows")]
    root: PathBuf,
    #[arg(long, global = true, default_value = "waypoint.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `waypoint.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Mark stale non-terminal runs as crashed.
    Reconcile {
        /// Idle seconds before a run counts as crashed (defaults to config).
        #[arg(long)]
        stale_secs: Option<u64>,
    },
    /// Print the manifest reduced from a run's journal.
    Manifest {
        workflow_id: String,
        run_id: String,
        /// Also refresh the run's `manifest.json` cache.
        #[arg(long)]
        write: bool,
    },
    /// Append a cancellation to a run that has not ended.
    Cancel {
        workflow_id: String,
        run_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Query or rebuild the run index.
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// Plan, execute and verify until the gates pass or a budget runs out.
    Build {
        workflow_dir: PathBuf,
        #[arg(long, required_unless_present = "resume")]
        goal: Option<String>,
        /// Enable an optional gate in addition to the defaults.
        #[arg(long = "gate")]
        gates: Vec<String>,
        /// Continue an interrupted build.
        #[arg(long)]
        resume: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    List {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Count {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Re-derive the index from every journal.
    Rebuild,
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(long)]
    workflow: Option<String>,
    /// running, success, failed or crashed.
    #[arg(long)]
    status: Option<RunStatus>,
}

impl From<FilterArgs> for RunFilter {
    fn from(args: FilterArgs) -> Self {
        Self {
            workflow_id: args.workflow,
            status: args.status,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let layout = WorkflowsLayout::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Reconcile { stale_secs } => cmd_reconcile(&layout, &cli.config, stale_secs),
        Command::Manifest {
            workflow_id,
            run_id,
            write,
        } => cmd_manifest(&layout, &workflow_id, &run_id, write),
        Command::Cancel {
            workflow_id,
            run_id,
            reason,
        } => cmd_cancel(&layout, &workflow_id, &run_id, &reason),
        Command::Runs { command } => cmd_runs(&layout, command),
        Command::Build {
            workflow_dir,
            goal,
            gates,
            resume,
        } => cmd_build(&cli.config, &workflow_dir, goal, &gates, resume),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }
    write_config(config_path, &WaypointConfig::default())?;
    Ok(exit_codes::OK)
}

fn cmd_reconcile(layout: &WorkflowsLayout, config_path: &Path, stale_secs: Option<u64>) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let stale = Duration::from_secs(stale_secs.unwrap_or(cfg.runs.stale_timeout_secs));
    let index = RunIndex::for_layout(layout);
    let report = scan_and_reconcile(layout, stale, Some(&index))?;
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn cmd_manifest(layout: &WorkflowsLayout, workflow_id: &str, run_id: &str, write: bool) -> Result<i32> {
    let run = layout.run(workflow_id, run_id);
    if !run.events_path.exists() {
        return Err(anyhow!("no journal at {}", run.events_path.display()));
    }
    let manifest = if write {
        refresh_manifest(&run)?
    } else {
        load_manifest(&run)?
    };
    print_json(&manifest)?;
    Ok(exit_codes::OK)
}

fn cmd_cancel(layout: &WorkflowsLayout, workflow_id: &str, run_id: &str, reason: &str) -> Result<i32> {
    let index = RunIndex::for_layout(layout);
    match cancel(layout, workflow_id, run_id, reason, Some(&index))? {
        Some(manifest) => print_json(&manifest)?,
        None => eprintln!("run {run_id} already ended; nothing to cancel"),
    }
    Ok(exit_codes::OK)
}

fn cmd_runs(layout: &WorkflowsLayout, command: RunsCommand) -> Result<i32> {
    let index = RunIndex::for_layout(layout);
    match command {
        RunsCommand::List {
            filter,
            offset,
            limit,
        } => print_json(&index.list(&filter.into(), offset, limit)?)?,
        RunsCommand::Count { filter } => println!("{}", index.count(&filter.into())?),
        RunsCommand::Rebuild => println!("{}", index.rebuild(layout)?),
    }
    Ok(exit_codes::OK)
}

fn cmd_build(
    config_path: &Path,
    workflow_dir: &Path,
    goal: Option<String>,
    extra_gates: &[String],
    resume: Option<String>,
) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let gates = match &resume {
        Some(build_id) => {
            let state = load_build_state(workflow_dir, build_id)?;
            journaled_gates(&cfg, &state.gates)?
        }
        None => cfg.resolve_gates(extra_gates)?,
    };
    let config_dir = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let skills = SkillRegistry::load(&cfg.skills, config_dir)?;
    let build_id = resume.clone().unwrap_or_else(generate_build_id);
    let agent = CommandAgent::from_config(&cfg.agent)
        .with_log_dir(BuildPaths::new(workflow_dir, &build_id).dir.join("agent"));
    let runner = CommandGateRunner::default();
    let agents = Collaborators {
        planner: &agent,
        executor: &agent,
        gates: &runner,
    };

    let report = run_build(
        workflow_dir,
        BuildOptions {
            goal: goal.unwrap_or_default(),
            gates,
            budgets: cfg.budgets,
            agent: cfg.agent.clone(),
            build_id: Some(build_id),
            resume,
            skills,
        },
        &agents,
    )
    .with_context(|| format!("build in {}", workflow_dir.display()))?;
    print_json(&report)?;
    Ok(exit_code_for(report.outcome))
}

/// Resolve the gates a build recorded when it started, in recorded order.
fn journaled_gates(cfg: &WaypointConfig, names: &[String]) -> Result<Vec<GateSpec>> {
    let resolved = cfg.resolve_gates(names)?;
    Ok(names
        .iter()
        .filter_map(|name| resolved.iter().find(|gate| &gate.name == name).cloned())
        .collect())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["waypoint", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.root, PathBuf::from("workflows"));
    }

    #[test]
    fn parse_build_with_gates() {
        let cli = Cli::parse_from([
            "waypoint", "--root", "/tmp/wf", "build", "billing", "--goal", "ship it", "--gate",
            "lint", "--gate", "dry",
        ]);
        match cli.command {
            Command::Build {
                workflow_dir,
                goal,
                gates,
                resume,
            } => {
                assert_eq!(workflow_dir, PathBuf::from("billing"));
                assert_eq!(goal.as_deref(), Some("ship it"));
                assert_eq!(gates, vec!["lint".to_string(), "dry".to_string()]);
                assert!(resume.is_none());
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn build_requires_goal_unless_resuming() {
        assert!(Cli::try_parse_from(["waypoint", "build", "billing"]).is_err());
        assert!(Cli::try_parse_from(["waypoint", "build", "billing", "--resume", "build-1"]).is_ok());
    }

    #[test]
    fn parse_runs_list_filters() {
        let cli = Cli::parse_from([
            "waypoint", "runs", "list", "--status", "crashed", "--offset", "2", "--limit", "2",
        ]);
        match cli.command {
            Command::Runs {
                command:
                    RunsCommand::List {
                        filter,
                        offset,
                        limit,
                    },
            } => {
                assert_eq!(filter.status, Some(RunStatus::Crashed));
                assert_eq!((offset, limit), (2, 2));
            }
            _ => panic!("expected runs list"),
        }
    }
}
