//! `metaclaw logs` - events plus captured stdout/stderr.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::manager::Manager;

/// Prints the event trail and captured output of a run; with `follow`,
/// streams backend logs afterwards.
pub fn execute(state_dir: &Path, run_id: &str, follow: bool) -> Result<()> {
    let manager = Manager::open(state_dir)?;
    let record = manager.get_run(run_id)?;

    if let Ok(events) = manager.read_events(run_id) {
        for line in events {
            println!("{line}");
        }
    }
    for (label, file_name) in [("stdout", "stdout.log"), ("stderr", "stderr.log")] {
        let path = manager.run_log_path(run_id, file_name);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if !content.is_empty() {
                println!("--- {label} ---");
                print!("{content}");
                if !content.ends_with('\n') {
                    println!();
                }
            }
        }
    }

    if follow {
        manager.runtime_logs(&record, true)?;
    }
    Ok(())
}
