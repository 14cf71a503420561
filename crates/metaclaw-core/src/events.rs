//! Append-only JSONL run event log.
//!
//! One file per run under `<state-dir>/runs/<run-id>/events.jsonl`, one
//! JSON object per line. Writes are best-effort (no fsync); callers treat
//! append failures as non-fatal.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::now_rfc3339;

/// Lifecycle phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Adapter selected for the run.
    #[serde(rename = "runtime.resolve")]
    Resolve,
    /// Detached/daemon container started.
    #[serde(rename = "runtime.start")]
    Start,
    /// Container removed after an attached run.
    #[serde(rename = "runtime.cleanup")]
    Cleanup,
    /// Failing container preserved for a debug shell.
    #[serde(rename = "runtime.pause")]
    Pause,
    /// Run reached a terminal state.
    #[serde(rename = "runtime.exit")]
    Exit,
}

/// One event line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// RFC3339 (nanoseconds, UTC); filled on append.
    pub timestamp: String,
    /// Run the event belongs to; filled on append.
    pub run_id: String,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Backend name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime: String,
    /// Container id when known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    /// Human message.
    pub message: String,
    /// Error text for failure events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Event fields supplied by the caller; timestamp and run id are stamped
/// on append.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Lifecycle phase.
    pub phase: Phase,
    /// Backend name.
    pub runtime: String,
    /// Container id when known.
    pub container_id: String,
    /// Human message.
    pub message: String,
    /// Error text for failure events.
    pub error: String,
}

impl EventDraft {
    /// Shorthand constructor for the common fields.
    #[must_use]
    pub fn new(phase: Phase, runtime: &str, message: &str) -> Self {
        Self {
            phase,
            runtime: runtime.to_string(),
            container_id: String::new(),
            message: message.to_string(),
            error: String::new(),
        }
    }

    /// Sets the container id.
    #[must_use]
    pub fn container(mut self, container_id: &str) -> Self {
        self.container_id = container_id.to_string();
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn error(mut self, error: &str) -> Self {
        self.error = error.to_string();
        self
    }
}

/// Errors produced by the event log.
#[derive(Debug, Error)]
pub enum EventError {
    /// Filesystem failure on the events file.
    #[error("event log {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An event failed to serialize (should not happen for well-formed
    /// drafts).
    #[error("encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

fn events_path(state_dir: &Path, run_id: &str) -> PathBuf {
    state_dir.join("runs").join(run_id).join("events.jsonl")
}

/// Appends one event line, stamping timestamp and run id.
///
/// # Errors
///
/// I/O or encoding failures; callers log and continue.
pub fn append(state_dir: &Path, run_id: &str, draft: EventDraft) -> Result<(), EventError> {
    let event = Event {
        timestamp: now_rfc3339(),
        run_id: run_id.to_string(),
        phase: draft.phase,
        runtime: draft.runtime,
        container_id: draft.container_id,
        message: draft.message,
        error: draft.error,
    };
    let path = events_path(state_dir, run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| EventError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| EventError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let mut line = serde_json::to_vec(&event)?;
    line.push(b'\n');
    file.write_all(&line).map_err(|source| EventError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Reads the raw event lines for a run.
///
/// # Errors
///
/// I/O failures, including a missing log.
pub fn read(state_dir: &Path, run_id: &str) -> Result<Vec<String>, EventError> {
    let path = events_path(state_dir, run_id);
    let file = fs::File::open(&path).map_err(|source| EventError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        lines.push(line.map_err(|source| EventError::Io {
            path: path.display().to_string(),
            source,
        })?);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        append(
            dir.path(),
            "run-1",
            EventDraft::new(Phase::Resolve, "podman", "runtime selected"),
        )
        .unwrap();
        append(
            dir.path(),
            "run-1",
            EventDraft::new(Phase::Exit, "podman", "completed").container("ctr-1"),
        )
        .unwrap();

        let lines = read(dir.path(), "run-1").unwrap();
        assert_eq!(lines.len(), 2);

        let first: Event = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.phase, Phase::Resolve);
        assert_eq!(first.run_id, "run-1");
        assert!(!first.timestamp.is_empty());

        let second: Event = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second.phase, Phase::Exit);
        assert_eq!(second.container_id, "ctr-1");
    }

    #[test]
    fn phases_serialize_with_runtime_prefix() {
        let json = serde_json::to_string(&Phase::Pause).unwrap();
        assert_eq!(json, "\"runtime.pause\"");
        let back: Phase = serde_json::from_str("\"runtime.cleanup\"").unwrap();
        assert_eq!(back, Phase::Cleanup);
    }

    #[test]
    fn reading_a_missing_log_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path(), "absent").is_err());
    }
}
