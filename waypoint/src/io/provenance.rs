//! Provenance captured when a run starts.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::core::event::Provenance;
use crate::io::process::run_command_with_timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Describe the environment a run starts in. Never fails: fields that cannot
/// be determined are left empty.
pub fn capture(working_dir: Option<&Path>, extra: BTreeMap<String, String>) -> Provenance {
    let working_dir = working_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok());
    let git_sha = working_dir.as_deref().and_then(head_sha);
    Provenance {
        waypoint_version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        working_dir: working_dir.map(|dir| dir.display().to_string()),
        git_sha,
        extra,
    }
}

/// `git rev-parse HEAD` in `dir`, if `dir` is inside a repository.
fn head_sha(dir: &Path) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(["rev-parse", "HEAD"]).current_dir(dir);
    match run_command_with_timeout(cmd, None, GIT_TIMEOUT, 256) {
        Ok(output) if output.success() => {
            let sha = output.stdout_text().trim().to_string();
            (!sha.is_empty()).then_some(sha)
        }
        Ok(output) => {
            debug!(exit_code = ?output.status.code(), "no git sha for provenance");
            None
        }
        Err(err) => {
            debug!(err = %format!("{err:#}"), "git unavailable for provenance");
            None
        }
    }
}
