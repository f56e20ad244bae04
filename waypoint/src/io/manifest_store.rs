//! Derived `manifest.json` cache next to each journal.
//!
//! The cache is never authoritative: [`load_manifest`] always re-reduces the
//! journal, and the cached file only exists for humans and external tools.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::manifest::{Manifest, reduce};
use crate::io::atomic::write_atomic;
use crate::io::journal::read_journal;
use crate::io::layout::RunPaths;

/// Reduce the run's journal into its current manifest.
pub fn load_manifest(run: &RunPaths) -> Result<Manifest> {
    let read = read_journal(&run.events_path)
        .with_context(|| format!("read journal {}", run.events_path.display()))?;
    let mut manifest = reduce(read.events());
    if manifest.workflow_id.is_empty() {
        manifest.workflow_id = run.workflow_id.clone();
    }
    if manifest.run_id.is_empty() {
        manifest.run_id = run.run_id.clone();
    }
    debug!(
        run_id = %run.run_id,
        status = manifest.status.as_str(),
        events = manifest.event_count,
        skipped = read.skipped,
        "manifest reduced"
    );
    Ok(manifest)
}

/// Atomically write the manifest cache.
pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    debug!(path = %path.display(), status = manifest.status.as_str(), "writing manifest cache");
    let mut buf = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Read a previously written manifest cache.
pub fn read_cached_manifest(path: &Path) -> Result<Manifest> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read manifest {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse manifest {}", path.display()))
}

/// Reduce the journal and refresh the cache in one step.
pub fn refresh_manifest(run: &RunPaths) -> Result<Manifest> {
    let manifest = load_manifest(run)?;
    write_manifest(&run.manifest_path, &manifest)?;
    Ok(manifest)
}
