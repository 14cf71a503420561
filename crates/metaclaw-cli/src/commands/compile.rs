//! `metaclaw compile` - produce a capsule.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::compiler;

/// Compiles a clawfile into a capsule under `out`.
pub fn execute(file: &Path, out: &Path) -> Result<()> {
    let result = compiler::compile(file, out)?;
    println!("capsule: {}", result.capsule.path.display());
    println!("capsule_id: {}", result.capsule.id);
    Ok(())
}
