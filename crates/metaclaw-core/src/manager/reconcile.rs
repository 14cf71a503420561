//! Detached-run reconciliation against the backend.
//!
//! A row that says `running` with a known container id is checked against
//! the backend's inspect payload. Terminal containers flip the row to
//! `succeeded`/`failed`, stamp the ending timestamp and exit code, and
//! append exactly one `runtime.exit` event. Inspect failures leave the row
//! untouched; the backend may simply be busy.

use std::time::Duration;

use tracing::warn;

use crate::events::{EventDraft, Phase};
use crate::runtime::inspect::parse_container_state;
use crate::runtime::Adapter;
use crate::store::{RunRecord, RunStatus};

use super::Manager;

/// Deadline for one backend inspection during reconciliation.
pub const INSPECT_DEADLINE: Duration = Duration::from_secs(5);

/// What an inspected container status means for the run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerDisposition {
    /// Container still alive; row stays `running`.
    NonTerminal,
    /// Container ended; row becomes the carried status.
    Terminal(RunStatus),
    /// Unrecognized backend status; row stays untouched.
    Unknown,
}

/// Maps a lower-cased backend container status onto the run state machine.
#[must_use]
pub fn map_container_status(status: &str, exit_code: Option<i32>) -> ContainerDisposition {
    match status.trim() {
        "running" | "created" | "restarting" | "paused" => ContainerDisposition::NonTerminal,
        "exited" | "dead" | "stopped" => {
            if exit_code == Some(0) {
                ContainerDisposition::Terminal(RunStatus::Succeeded)
            } else {
                ContainerDisposition::Terminal(RunStatus::Failed)
            }
        }
        _ => ContainerDisposition::Unknown,
    }
}

impl Manager {
    /// Reconciles one record; returns the prior record whenever the
    /// backend cannot be consulted.
    pub(super) fn refresh_run_status(&self, record: RunRecord) -> RunRecord {
        if record.status != RunStatus::Running || record.container_id.is_empty() {
            return record;
        }
        let Ok(adapter) = self.adapter_for(&record) else {
            return record;
        };
        let raw = match adapter.inspect(&record.container_id, INSPECT_DEADLINE) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(run_id = %record.run_id, error = %err, "inspect failed; leaving row unchanged");
                return record;
            }
        };
        let (status, exit_code) = match parse_container_state(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(run_id = %record.run_id, error = %err, "inspect payload unusable");
                return record;
            }
        };
        let ContainerDisposition::Terminal(new_status) = map_container_status(&status, exit_code)
        else {
            return record;
        };

        let last_error = if new_status == RunStatus::Failed {
            exit_code.map_or_else(
                || "detached container exited".to_string(),
                |code| format!("detached container exited with code {code}"),
            )
        } else {
            String::new()
        };
        if let Err(err) = self.store.update_run_completion(
            &record.run_id,
            new_status,
            &record.container_id,
            exit_code,
            &last_error,
        ) {
            warn!(run_id = %record.run_id, error = %err, "reconcile completion update failed");
            return record;
        }

        let mut updated = record;
        updated.status = new_status;
        updated.exit_code = exit_code;
        updated.last_error = last_error.clone();
        updated.ended_at = crate::store::now_rfc3339();

        let message = if new_status == RunStatus::Succeeded {
            "completed"
        } else {
            "failed"
        };
        self.emit(
            &updated.run_id,
            EventDraft::new(Phase::Exit, &updated.runtime_target, message)
                .container(&updated.container_id)
                .error(&last_error),
        );
        updated
    }
}
