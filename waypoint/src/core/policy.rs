//! Mode policy for agent tool use.
//!
//! PLAN mode may only observe; EXECUTE mode may also change the workspace.
//! Classification is pure so it can be checked before any side effect happens.

use thiserror::Error;

use crate::core::types::BuildMode;

/// Operation an agent asks the tool surface to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOp {
    ReadFile,
    ListDir,
    WriteFile,
    RemoveFile,
    RunShell,
}

impl ToolOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::ListDir => "list_dir",
            Self::WriteFile => "write_file",
            Self::RemoveFile => "remove_file",
            Self::RunShell => "run_shell",
        }
    }

    /// Writes and shell commands can change state irreversibly.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::WriteFile | Self::RemoveFile | Self::RunShell)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op_name} is not allowed in {mode_name} mode", op_name = .op.as_str(), mode_name = .mode.as_str())]
pub struct PolicyViolation {
    pub mode: BuildMode,
    pub op: ToolOp,
}

/// Authorize `op` under `mode`.
pub fn authorize(mode: BuildMode, op: ToolOp) -> Result<(), PolicyViolation> {
    if mode == BuildMode::Plan && op.is_destructive() {
        return Err(PolicyViolation { mode, op });
    }
    Ok(())
}
