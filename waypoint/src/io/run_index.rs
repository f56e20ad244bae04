//! Append-only run index (`<root>/index.jsonl`).
//!
//! The index is a query cache over run journals. Every interesting transition
//! appends one [`RunRecord`]; queries collapse repeated records of a run to the
//! most recent one while keeping the run at the position where it first
//! appeared, which keeps pagination stable as runs progress. When the index is
//! lost or damaged, [`RunIndex::rebuild`] re-derives it from the journals.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::manifest::{Manifest, RunStatus};
use crate::io::atomic::write_atomic;
use crate::io::journal::ends_with_newline;
use crate::io::layout::WorkflowsLayout;
use crate::io::manifest_store::load_manifest;

/// Flattened summary of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            run_id: manifest.run_id.clone(),
            workflow_id: manifest.workflow_id.clone(),
            status: manifest.status,
            started_at: manifest.started_at,
            ended_at: manifest.ended_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    fn matches(&self, record: &RunRecord) -> bool {
        self.workflow_id
            .as_deref()
            .is_none_or(|wf| wf == record.workflow_id)
            && self.status.is_none_or(|status| status == record.status)
    }
}

#[derive(Debug, Clone)]
pub struct RunIndex {
    path: PathBuf,
}

impl RunIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_layout(layout: &WorkflowsLayout) -> Self {
        Self::new(layout.index_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub fn record(&self, record: &RunRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serialize run record")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create index directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open run index {}", self.path.display()))?;
        if !ends_with_newline(&mut file)
            .with_context(|| format!("read run index tail {}", self.path.display()))?
        {
            warn!(path = %self.path.display(), "run index ends with a torn record; starting a new line");
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .with_context(|| format!("append run index {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync run index {}", self.path.display()))?;
        debug!(
            run_id = %record.run_id,
            status = record.status.as_str(),
            "run index record appended"
        );
        Ok(())
    }

    /// Matching runs in first-appearance order, paginated.
    pub fn list(&self, filter: &RunFilter, offset: usize, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self
            .latest_records()?
            .into_iter()
            .filter(|record| filter.matches(record))
            .skip(offset)
            .take(limit)
            .collect())
    }

    pub fn count(&self, filter: &RunFilter) -> Result<usize> {
        Ok(self
            .latest_records()?
            .iter()
            .filter(|record| filter.matches(record))
            .count())
    }

    /// Re-derive the index from every journal under `layout` and atomically
    /// replace the index file. Returns the number of runs indexed.
    pub fn rebuild(&self, layout: &WorkflowsLayout) -> Result<usize> {
        let mut records = Vec::new();
        for run in layout.discover_runs()? {
            if !run.events_path.exists() {
                continue;
            }
            match load_manifest(&run) {
                Ok(manifest) if manifest.event_count > 0 => {
                    records.push(RunRecord::from_manifest(&manifest));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(run_dir = %run.dir.display(), err = %format!("{err:#}"), "skipping unreadable run during rebuild");
                }
            }
        }
        records.sort_by(|a, b| {
            (a.started_at, &a.workflow_id, &a.run_id).cmp(&(b.started_at, &b.workflow_id, &b.run_id))
        });

        let mut buf = String::new();
        for record in &records {
            buf.push_str(&serde_json::to_string(record).context("serialize run record")?);
            buf.push('\n');
        }
        write_atomic(&self.path, &buf)?;
        info!(path = %self.path.display(), runs = records.len(), "run index rebuilt");
        Ok(records.len())
    }

    fn latest_records(&self) -> Result<Vec<RunRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("open run index {}", self.path.display()));
            }
        };

        let mut records: Vec<RunRecord> = Vec::new();
        let mut positions: HashMap<(String, String), usize> = HashMap::new();
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut line_no = 0usize;
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("read run index {}", self.path.display()))?;
            if read == 0 {
                break;
            }
            line_no += 1;
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim();
            if line.is_empty() {
                continue;
            }
            let record: RunRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(path = %self.path.display(), line = line_no, err = %err, "skipping unparsable index line");
                    continue;
                }
            };
            let key = (record.workflow_id.clone(), record.run_id.clone());
            match positions.get(&key) {
                Some(&idx) => records[idx] = record,
                None => {
                    positions.insert(key, records.len());
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}
