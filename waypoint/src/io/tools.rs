//! Mode-gated tool surface handed to executors.
//!
//! Every operation is authorized against the build mode before it touches the
//! workspace, so a PLAN-mode caller gets a [`PolicyViolation`] instead of a
//! side effect. Paths are confined to the surface root.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::policy::{PolicyViolation, ToolOp, authorize};
use crate::core::types::BuildMode;
use crate::io::process::{CommandOutput, run_command_with_timeout};

#[derive(Debug, Clone)]
pub struct ToolSurface {
    mode: BuildMode,
    root: PathBuf,
    shell_timeout: Duration,
    output_limit_bytes: usize,
}

impl ToolSurface {
    pub fn new(mode: BuildMode, root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            root: root.into(),
            shell_timeout: Duration::from_secs(10 * 60),
            output_limit_bytes: 100_000,
        }
    }

    pub fn with_shell_limits(mut self, timeout: Duration, output_limit_bytes: usize) -> Self {
        self.shell_timeout = timeout;
        self.output_limit_bytes = output_limit_bytes;
        self
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn authorize(&self, op: ToolOp) -> Result<(), PolicyViolation> {
        authorize(self.mode, op).inspect_err(|violation| {
            warn!(op = op.as_str(), mode = self.mode.as_str(), "{violation}");
        })
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        self.authorize(ToolOp::ReadFile)?;
        let path = self.resolve(rel)?;
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn list_dir(&self, rel: &str) -> Result<Vec<String>> {
        self.authorize(ToolOp::ListDir)?;
        let path = self.resolve(rel)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).with_context(|| format!("list {}", path.display()))? {
            let entry = entry.with_context(|| format!("list {}", path.display()))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        self.authorize(ToolOp::WriteFile)?;
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        debug!(path = %path.display(), bytes = contents.len(), "tool write_file");
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn remove_file(&self, rel: &str) -> Result<()> {
        self.authorize(ToolOp::RemoveFile)?;
        let path = self.resolve(rel)?;
        debug!(path = %path.display(), "tool remove_file");
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }

    /// Run `script` with `sh -c` in the surface root.
    pub fn run_shell(&self, script: &str) -> Result<CommandOutput> {
        self.authorize(ToolOp::RunShell)?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).current_dir(&self.root);
        run_command_with_timeout(cmd, None, self.shell_timeout, self.output_limit_bytes)
    }

    /// Spawn `cmd` in the surface root. Spawning a process counts as a shell run.
    pub fn run_command(&self, mut cmd: Command, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        self.authorize(ToolOp::RunShell)?;
        cmd.current_dir(&self.root);
        run_command_with_timeout(cmd, stdin, self.shell_timeout, self.output_limit_bytes)
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        join_within(&self.root, rel)
    }
}

/// Join `rel` onto `root`, refusing absolute paths and `..` components.
pub fn join_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(anyhow!(
            "path {} must be relative to {} without '..'",
            rel.display(),
            root.display()
        ));
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_mode_reads_but_never_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "hello").expect("seed");
        let surface = ToolSurface::new(BuildMode::Plan, temp.path());

        assert_eq!(surface.read_file("a.txt").expect("read"), "hello");
        assert_eq!(surface.list_dir(".").expect("list"), vec!["a.txt"]);

        let err = surface.write_file("b.txt", "nope").unwrap_err();
        let violation = err.downcast_ref::<PolicyViolation>().expect("policy violation");
        assert_eq!(violation.op, ToolOp::WriteFile);
        assert!(!temp.path().join("b.txt").exists());

        let err = surface.run_shell("touch c.txt").unwrap_err();
        assert!(err.downcast_ref::<PolicyViolation>().is_some());
        assert!(!temp.path().join("c.txt").exists());

        assert!(surface.remove_file("a.txt").is_err());
        assert!(temp.path().join("a.txt").exists());
    }

    #[test]
    fn execute_mode_writes_and_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let surface = ToolSurface::new(BuildMode::Execute, temp.path());
        surface.write_file("nested/b.txt", "data").expect("write");
        let output = surface.run_shell("cat nested/b.txt").expect("shell");
        assert_eq!(output.stdout_text(), "data");
        surface.remove_file("nested/b.txt").expect("remove");
    }

    #[test]
    fn paths_cannot_escape_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let surface = ToolSurface::new(BuildMode::Execute, temp.path());
        assert!(surface.write_file("../escape.txt", "x").is_err());
        assert!(surface.read_file("/etc/passwd").is_err());
    }
}
