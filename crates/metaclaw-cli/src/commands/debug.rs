//! `metaclaw debug shell` - interactive shell into a preserved container.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::manager::Manager;

/// Opens a shell inside a `running` or `failed_paused` container.
pub fn execute(state_dir: &Path, run_id: &str) -> Result<()> {
    let manager = Manager::open(state_dir)?;
    manager.debug_shell(run_id)?;
    Ok(())
}
