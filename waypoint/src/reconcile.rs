//! Crash detection for runs whose process died before journaling an end.
//!
//! A run is stale when its journal has been idle for at least the stale
//! timeout while its reduced status is still `running`. Reconciling appends
//! one `workflow.failed` event with the crash marker; earlier entries are never
//! touched, and a run that already ended is left alone.

use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::event::{CRASHED_REASON, Event, EventType, WorkflowFailed};
use crate::core::manifest::{Manifest, RunStatus};
use crate::io::journal::Journal;
use crate::io::layout::{RunPaths, WorkflowsLayout};
use crate::io::manifest_store::{load_manifest, refresh_manifest};
use crate::io::run_index::{RunIndex, RunRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileResult {
    /// No journal, or a journal with no readable events.
    Empty,
    /// Already ended; nothing appended.
    Terminal { status: RunStatus },
    /// Still running and recently active.
    Active {
        #[serde(with = "duration_secs")]
        idle: Duration,
    },
    /// Crash marker appended.
    Reconciled {
        #[serde(with = "duration_secs")]
        idle: Duration,
    },
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// Check one run and mark it crashed if it went stale.
#[instrument(skip_all, fields(run_id = %run.run_id))]
pub fn reconcile(run: &RunPaths, stale_timeout: Duration) -> Result<ReconcileResult> {
    Ok(reconcile_run(run, stale_timeout)?.0)
}

fn reconcile_run(run: &RunPaths, stale_timeout: Duration) -> Result<(ReconcileResult, Manifest)> {
    let manifest = load_manifest(run)?;
    if manifest.event_count == 0 {
        return Ok((ReconcileResult::Empty, manifest));
    }
    if manifest.status.is_terminal() {
        return Ok((
            ReconcileResult::Terminal {
                status: manifest.status,
            },
            manifest,
        ));
    }

    let idle = idle_time(run, &manifest);
    if idle < stale_timeout {
        debug!(idle_secs = idle.as_secs(), "run still active");
        return Ok((ReconcileResult::Active { idle }, manifest));
    }

    let event = Event::new(
        EventType::WorkflowFailed,
        manifest.workflow_id.as_str(),
        manifest.run_id.as_str(),
        &WorkflowFailed {
            reason: CRASHED_REASON.to_string(),
        },
    )
    .context("build crash event")?;
    Journal::open(&run.events_path)?.append(event)?;

    let manifest = refresh_manifest(run)?;
    info!(idle_secs = idle.as_secs(), "marked stale run as crashed");
    Ok((ReconcileResult::Reconciled { idle }, manifest))
}

/// Time since the journal was last written, falling back to the newest event
/// timestamp when the file time is unavailable.
fn idle_time(run: &RunPaths, manifest: &Manifest) -> Duration {
    let modified = std::fs::metadata(&run.events_path).and_then(|meta| meta.modified());
    match modified {
        Ok(modified) => SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default(),
        Err(err) => {
            debug!(err = %err, "no journal mtime; using last event time");
            manifest
                .last_event_at
                .and_then(|at| (Utc::now() - at).to_std().ok())
                .unwrap_or_default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    /// `workflow_id/run_id` of every run marked crashed by this scan.
    pub reconciled: Vec<String>,
    pub errors: Vec<ScanError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanError {
    pub run_dir: String,
    pub error: String,
}

/// Reconcile every run under `layout`. Per-run failures are collected into the
/// report instead of aborting the scan.
pub fn scan_and_reconcile(
    layout: &WorkflowsLayout,
    stale_timeout: Duration,
    index: Option<&RunIndex>,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    for run in layout.discover_runs()? {
        report.scanned += 1;
        match reconcile_run(&run, stale_timeout) {
            Ok((ReconcileResult::Reconciled { .. }, manifest)) => {
                if let Some(index) = index
                    && let Err(err) = index.record(&RunRecord::from_manifest(&manifest))
                {
                    warn!(run_dir = %run.dir.display(), err = %format!("{err:#}"), "failed to index reconciled run");
                }
                report
                    .reconciled
                    .push(format!("{}/{}", run.workflow_id, run.run_id));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(run_dir = %run.dir.display(), err = %format!("{err:#}"), "reconcile failed");
                report.errors.push(ScanError {
                    run_dir: run.dir.display().to_string(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    info!(
        scanned = report.scanned,
        reconciled = report.reconciled.len(),
        errors = report.errors.len(),
        "reconcile scan finished"
    );
    Ok(report)
}
