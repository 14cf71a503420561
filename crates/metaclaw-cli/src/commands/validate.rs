//! `metaclaw validate` - normalize and print the JSON IR.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::compiler;

/// Normalizes and validates a clawfile, printing the JSON IR on success.
pub fn execute(file: &Path) -> Result<()> {
    let cfg = compiler::load_normalize(file)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    println!("validation: OK");
    Ok(())
}
