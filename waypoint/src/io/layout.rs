//! On-disk layout of the workflows root.
//!
//! ```text
//! <root>/
//!   index.jsonl
//!   <workflow_id>/runs/<run_id>/
//!     events.jsonl
//!     manifest.json
//!     output.log
//!     results/
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Canonical paths of one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub workflow_id: String,
    pub run_id: String,
    pub dir: PathBuf,
    pub events_path: PathBuf,
    pub manifest_path: PathBuf,
    pub output_log_path: PathBuf,
    pub results_dir: PathBuf,
}

impl RunPaths {
    pub fn new(dir: impl Into<PathBuf>, workflow_id: &str, run_id: &str) -> Self {
        let dir = dir.into();
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            events_path: dir.join("events.jsonl"),
            manifest_path: dir.join("manifest.json"),
            output_log_path: dir.join("output.log"),
            results_dir: dir.join("results"),
            dir,
        }
    }

    /// Derive paths from a bare run directory (`.../<workflow_id>/runs/<run_id>`).
    pub fn from_dir(dir: &Path) -> Self {
        let run_id = file_name(dir);
        let workflow_id = dir
            .parent()
            .and_then(Path::parent)
            .map(file_name)
            .unwrap_or_default();
        Self::new(dir, &workflow_id, &run_id)
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("create run directory {}", self.results_dir.display()))
    }
}

/// Root directory holding every workflow's runs plus the run index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowsLayout {
    pub root: PathBuf,
}

impl WorkflowsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.jsonl")
    }

    pub fn runs_dir(&self, workflow_id: &str) -> PathBuf {
        self.root.join(workflow_id).join("runs")
    }

    pub fn run(&self, workflow_id: &str, run_id: &str) -> RunPaths {
        RunPaths::new(self.runs_dir(workflow_id).join(run_id), workflow_id, run_id)
    }

    /// Every run directory under the root, sorted by workflow id then run id.
    ///
    /// A missing root yields no runs. A workflow whose `runs/` cannot be
    /// listed is skipped with a warning.
    pub fn discover_runs(&self) -> Result<Vec<RunPaths>> {
        let mut runs = Vec::new();
        for workflow_dir in sorted_subdirs(&self.root)? {
            let workflow_id = file_name(&workflow_dir);
            let run_dirs = match sorted_subdirs(&workflow_dir.join("runs")) {
                Ok(dirs) => dirs,
                Err(err) => {
                    warn!(workflow_id = %workflow_id, err = %format!("{err:#}"), "skipping unreadable runs directory");
                    continue;
                }
            };
            for run_dir in run_dirs {
                runs.push(RunPaths::new(&run_dir, &workflow_id, &file_name(&run_dir)));
            }
        }
        debug!(root = %self.root.display(), count = runs.len(), "discovered runs");
        Ok(runs)
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read directory {}", dir.display())),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_paths_are_stable() {
        let layout = WorkflowsLayout::new("/tmp/wf");
        let run = layout.run("billing", "run-1");
        assert!(run.dir.ends_with(Path::new("billing/runs/run-1")));
        assert!(run.events_path.ends_with("events.jsonl"));
        assert!(run.manifest_path.ends_with("manifest.json"));
        assert!(run.output_log_path.ends_with("output.log"));
        assert!(run.results_dir.ends_with("results"));
        assert_eq!(layout.index_path(), PathBuf::from("/tmp/wf/index.jsonl"));
        assert_eq!(RunPaths::from_dir(&run.dir), run);
    }

    #[test]
    fn unreadable_runs_directory_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkflowsLayout::new(temp.path());
        layout.run("a", "run-1").create_dirs().expect("create");
        fs::create_dir_all(temp.path().join("b")).expect("mkdir b");
        fs::write(temp.path().join("b/runs"), "not a directory").expect("write");

        let found: Vec<String> = layout
            .discover_runs()
            .expect("discover")
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(found, vec!["run-1".to_string()]);
    }

    #[test]
    fn discover_runs_is_sorted_and_ignores_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkflowsLayout::new(temp.path());
        for (wf, run) in [("b", "run-2"), ("a", "run-9"), ("b", "run-1")] {
            layout.run(wf, run).create_dirs().expect("create");
        }
        fs::write(temp.path().join("index.jsonl"), "").expect("write index");

        let found: Vec<(String, String)> = layout
            .discover_runs()
            .expect("discover")
            .into_iter()
            .map(|r| (r.workflow_id, r.run_id))
            .collect();
        assert_eq!(
            found,
            vec![
                ("a".to_string(), "run-9".to_string()),
                ("b".to_string(), "run-1".to_string()),
                ("b".to_string(), "run-2".to_string()),
            ]
        );
    }

    #[test]
    fn missing_root_has_no_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = WorkflowsLayout::new(temp.path().join("missing"));
        assert!(layout.discover_runs().expect("discover").is_empty());
    }
}
