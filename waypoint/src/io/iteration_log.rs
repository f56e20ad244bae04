//! Build artifacts under `<workflow_dir>/builds/<build_id>/`.
//!
//! The journal is the source of truth for a build; the files here are human
//! readable logs written alongside it and are not read back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::GateResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPaths {
    pub dir: PathBuf,
    pub events_path: PathBuf,
    pub report_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl BuildPaths {
    pub fn new(workflow_dir: &Path, build_id: &str) -> Self {
        let dir = workflow_dir.join("builds").join(build_id);
        Self {
            events_path: dir.join("events.jsonl"),
            report_path: dir.join("report.json"),
            iterations_dir: dir.join("iterations"),
            dir,
        }
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(iteration.to_string())
    }

    pub fn plan_path(&self, iteration: u32) -> PathBuf {
        self.iteration_dir(iteration).join("plan.md")
    }

    pub fn gate_log_path(&self, iteration: u32, gate: &str) -> PathBuf {
        self.iteration_dir(iteration)
            .join("gates")
            .join(format!("{}.log", sanitize(gate)))
    }
}

pub fn write_plan(paths: &BuildPaths, iteration: u32, plan: &str) -> Result<PathBuf> {
    let path = paths.plan_path(iteration);
    let mut body = plan.trim_end().to_string();
    body.push('\n');
    write_text(&path, &body)?;
    Ok(path)
}

pub fn write_gate_log(paths: &BuildPaths, iteration: u32, result: &GateResult) -> Result<PathBuf> {
    let path = paths.gate_log_path(iteration, &result.name);
    let mut buf = format!(
        "gate: {}\npassed: {}\ntimed_out: {}\nduration_ms: {}\n\n",
        result.name, result.passed, result.timed_out, result.duration_ms
    );
    buf.push_str(&result.output);
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    write_text(&path, &buf)?;
    Ok(path)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Keep gate names usable as file names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_paths_are_stable() {
        let paths = BuildPaths::new(Path::new("/wf"), "build-1");
        assert_eq!(paths.events_path, PathBuf::from("/wf/builds/build-1/events.jsonl"));
        assert_eq!(
            paths.gate_log_path(2, "dry run"),
            PathBuf::from("/wf/builds/build-1/iterations/2/gates/dry_run.log")
        );
    }

    #[test]
    fn writes_gate_log_with_header() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = BuildPaths::new(temp.path(), "build-1");
        let result = GateResult {
            name: "validate".to_string(),
            passed: false,
            output: "missing field".to_string(),
            duration_ms: 12,
            timed_out: false,
        };
        let path = write_gate_log(&paths, 1, &result).expect("write");
        let contents = fs::read_to_string(path).expect("read");
        assert!(contents.starts_with("gate: validate\npassed: false\n"));
        assert!(contents.ends_with("missing field\n"));
    }
}
