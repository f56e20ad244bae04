//! Verification gates: named, time-boxed external checks.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::GateResult;
use crate::io::config::GateSpec;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

pub trait GateRunner {
    /// Run one gate against `workflow_dir`. Gate failures are results, not errors.
    fn run(&self, gate: &GateSpec, workflow_dir: &Path) -> Result<GateResult>;
}

/// Spawns the gate's argv with `workflow_dir` as working directory.
#[derive(Debug, Clone)]
pub struct CommandGateRunner {
    pub output_limit_bytes: usize,
}

impl Default for CommandGateRunner {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gate = %gate.name, timeout_secs = gate.timeout.as_secs()))]
    fn run(&self, gate: &GateSpec, workflow_dir: &Path) -> Result<GateResult> {
        let (program, args) = gate
            .command
            .split_first()
            .ok_or_else(|| anyhow!("gate '{}' has an empty command", gate.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workflow_dir);

        let output = match run_command_with_timeout(cmd, None, gate.timeout, self.output_limit_bytes)
        {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "gate could not be started");
                return Ok(GateResult {
                    name: gate.name.clone(),
                    passed: false,
                    output: format!("[gate failed to start: {err:#}]"),
                    duration_ms: 0,
                    timed_out: false,
                });
            }
        };

        let mut text = output.combined("gate");
        if output.timed_out {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!(
                "[gate timed out after {}s]\n",
                gate.timeout.as_secs()
            ));
        }
        let passed = output.success();
        info!(passed, timed_out = output.timed_out, "gate finished");
        Ok(GateResult {
            name: gate.name.clone(),
            passed,
            output: text,
            duration_ms: output.elapsed.as_millis() as u64,
            timed_out: output.timed_out,
        })
    }
}

/// Run every gate in declaration order. Results are reported in the same order.
pub fn run_all<R: GateRunner + ?Sized>(
    runner: &R,
    gates: &[GateSpec],
    workflow_dir: &Path,
) -> Result<Vec<GateResult>> {
    run_all_with(runner, gates, workflow_dir, |_| Ok(()))
}

/// [`run_all`], handing each result to `on_result` before the next gate
/// starts. An error from `on_result` stops the run.
pub fn run_all_with<R, F>(
    runner: &R,
    gates: &[GateSpec],
    workflow_dir: &Path,
    mut on_result: F,
) -> Result<Vec<GateResult>>
where
    R: GateRunner + ?Sized,
    F: FnMut(&GateResult) -> Result<()>,
{
    let mut results = Vec::with_capacity(gates.len());
    for gate in gates {
        let result = runner
            .run(gate, workflow_dir)
            .with_context(|| format!("run gate {}", gate.name))?;
        debug!(gate = %result.name, passed = result.passed, "gate result");
        on_result(&result)?;
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(name: &str, script: &str, timeout: Duration) -> GateSpec {
        GateSpec {
            name: name.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        }
    }

    #[test]
    fn passing_and_failing_gates_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("workflow.py"), "print('hi')\n").expect("write");
        let gates = vec![
            gate("exists", "test -f workflow.py", Duration::from_secs(10)),
            gate("fails", "echo broken >&2; exit 3", Duration::from_secs(10)),
        ];
        let results = run_all(&CommandGateRunner::default(), &gates, temp.path()).expect("run");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "exists");
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(results[1].output.contains("broken"));
    }

    #[test]
    fn each_result_is_seen_before_the_next_gate_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gates = vec![
            gate("first", "touch first.done", Duration::from_secs(10)),
            gate("second", "test -f seen", Duration::from_secs(10)),
        ];
        let mut seen = Vec::new();
        let results = run_all_with(&CommandGateRunner::default(), &gates, temp.path(), |result| {
            std::fs::write(temp.path().join("seen"), &result.name)?;
            seen.push(result.name.clone());
            Ok(())
        })
        .expect("run");
        assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
        assert!(results[1].passed);

        let err = run_all_with(&CommandGateRunner::default(), &gates, temp.path(), |_| {
            Err(anyhow!("journal unavailable"))
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("journal unavailable"));
    }

    #[test]
    fn timeout_fails_with_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = CommandGateRunner::default()
            .run(
                &gate("slow", "exec sleep 5", Duration::from_millis(100)),
                temp.path(),
            )
            .expect("run");
        assert!(!result.passed);
        assert!(result.timed_out);
        assert!(result.output.contains("[gate timed out after 0s]"));
    }

    #[test]
    fn missing_program_is_a_failed_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = GateSpec {
            name: "ghost".to_string(),
            command: vec!["waypoint-no-such-program".to_string()],
            timeout: Duration::from_secs(1),
        };
        let result = CommandGateRunner::default()
            .run(&spec, temp.path())
            .expect("run");
        assert!(!result.passed);
        assert!(result.output.contains("failed to start"));
    }
}
