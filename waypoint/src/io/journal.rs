//! Append-only JSONL journal, one file per run.
//!
//! Each line is a complete [`EventEnvelope`]. [`Journal::append`] serializes the
//! whole record before touching the file, writes it with a single `write_all`,
//! and syncs before returning, so a crash right after `append` leaves the
//! event durable and never leaves half of a record followed by a newline.
//!
//! Readers treat the file as a write-ahead log: unparsable lines (usually the
//! torn tail of a crashed write) are skipped, never fatal.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::event::{Event, EventEnvelope};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal {path} is not writable")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize event for {path}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Single writer for one run's journal file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    next_seq: u64,
}

impl Journal {
    /// Open (or create) the journal at `path` for appending.
    ///
    /// The next sequence number continues after the last readable record. If
    /// the file ends with a torn record, the next append starts on a new line.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let io_err = |source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;

        let existing = read_journal(path).map_err(io_err)?;
        let next_seq = existing
            .envelopes
            .last()
            .map(|env| env.seq + 1)
            .unwrap_or(0)
            .max(existing.envelopes.len() as u64);

        if !ends_with_newline(&mut file).map_err(io_err)? {
            warn!(path = %path.display(), "journal ends with a torn record; starting a new line");
            file.write_all(b"\n").map_err(io_err)?;
            file.sync_data().map_err(io_err)?;
        }

        debug!(path = %path.display(), next_seq, "journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_seq,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Durably append one event. Returns the envelope that was written.
    pub fn append(&mut self, event: Event) -> Result<EventEnvelope, JournalError> {
        let envelope = EventEnvelope::new(self.next_seq, event);
        let mut line = serde_json::to_string(&envelope).map_err(|source| JournalError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        line.push('\n');

        let io_err = |source| JournalError::Io {
            path: self.path.clone(),
            source,
        };
        self.file.write_all(line.as_bytes()).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)?;
        self.next_seq += 1;

        debug!(
            path = %self.path.display(),
            seq = envelope.seq,
            event_type = %envelope.event.event_type,
            "journal append"
        );
        Ok(envelope)
    }
}

/// True for empty files and files whose last byte is a newline.
pub(crate) fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Records recovered from a journal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalRead {
    pub envelopes: Vec<EventEnvelope>,
    /// Number of unparsable lines that were skipped.
    pub skipped: usize,
}

impl JournalRead {
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.envelopes.iter().map(|env| &env.event)
    }
}

/// Read every parsable record. A missing file reads as empty.
pub fn read_journal(path: &Path) -> std::io::Result<JournalRead> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(JournalRead::default()),
        Err(err) => return Err(err),
    };
    parse_journal(BufReader::new(file), path)
}

fn parse_journal<R: BufRead>(mut reader: R, path: &Path) -> std::io::Result<JournalRead> {
    let mut read = JournalRead::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        let text = String::from_utf8_lossy(&buf);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<EventEnvelope>(trimmed) {
            Ok(envelope) => read.envelopes.push(envelope),
            Err(err) => {
                warn!(path = %path.display(), line = line_no, err = %err, "skipping unparsable journal line");
                read.skipped += 1;
            }
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventType, StepStarted};

    fn event(step: &str) -> Event {
        Event::new(
            EventType::StepStarted,
            "wf",
            "run-1",
            &StepStarted {
                step: step.to_string(),
            },
        )
        .expect("event")
    }

    #[test]
    fn append_then_read_preserves_order_and_seq() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs/run-1/events.jsonl");
        let mut journal = Journal::open(&path).expect("open");
        journal.append(event("a")).expect("append a");
        journal.append(event("b")).expect("append b");

        let read = read_journal(&path).expect("read");
        assert_eq!(read.skipped, 0);
        let seqs: Vec<u64> = read.envelopes.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        let contents = fs::read_to_string(&path).expect("read raw");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn reopen_continues_sequence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        Journal::open(&path)
            .expect("open")
            .append(event("a"))
            .expect("append");
        let mut journal = Journal::open(&path).expect("reopen");
        assert_eq!(journal.next_seq(), 1);
        let env = journal.append(event("b")).expect("append");
        assert_eq!(env.seq, 1);
    }

    #[test]
    fn torn_tail_is_skipped_and_repaired_on_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        Journal::open(&path)
            .expect("open")
            .append(event("a"))
            .expect("append");
        let mut raw = OpenOptions::new().append(true).open(&path).expect("raw open");
        raw.write_all(b"{\"version\":1,\"seq\":1,\"ev").expect("torn write");
        drop(raw);

        let read = read_journal(&path).expect("read");
        assert_eq!(read.envelopes.len(), 1);
        assert_eq!(read.skipped, 1);

        let mut journal = Journal::open(&path).expect("reopen");
        journal.append(event("b")).expect("append after tear");
        let read = read_journal(&path).expect("read again");
        assert_eq!(read.envelopes.len(), 2);
        assert_eq!(read.skipped, 1);
        assert_eq!(read.envelopes[1].seq, 1);
    }

    #[test]
    fn missing_journal_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let read = read_journal(&temp.path().join("nope.jsonl")).expect("read");
        assert!(read.envelopes.is_empty());
    }

    #[test]
    fn unwritable_location_is_an_io_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").expect("write blocker");
        let err = Journal::open(&blocker.join("events.jsonl")).unwrap_err();
        assert!(matches!(err, JournalError::Io { .. }));
    }
}
