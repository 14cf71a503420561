//! `metaclaw ps` - list reconciled runs.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::manager::Manager;

/// Lists runs, newest first.
pub fn execute(state_dir: &Path, limit: usize, json: bool) -> Result<()> {
    let manager = Manager::open(state_dir)?;
    let runs = manager.list_runs(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:<26} {:<14} {:<10} {:<16} {:<26} {}",
        "RUN ID", "STATUS", "LIFECYCLE", "RUNTIME", "STARTED", "CONTAINER"
    );
    for run in runs {
        println!(
            "{:<26} {:<14} {:<10} {:<16} {:<26} {}",
            run.run_id,
            run.status.to_string(),
            run.lifecycle,
            run.runtime_target,
            run.started_at,
            run.container_id
        );
    }
    Ok(())
}
