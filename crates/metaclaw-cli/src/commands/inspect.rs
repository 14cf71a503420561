//! `metaclaw inspect` - run or capsule detail.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::capsule;
use metaclaw_core::manager::Manager;

/// Inspects a capsule directory or a run id.
pub fn execute(state_dir: &Path, target: &str, json: bool) -> Result<()> {
    let target_path = Path::new(target);
    if target_path.is_dir() {
        let manifest = capsule::load(target_path)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        } else {
            println!("capsule_id: {}", manifest.capsule_id);
            println!("source: {}", manifest.source_clawfile);
            println!("digests: {} entries", manifest.digests.len());
        }
        return Ok(());
    }

    let manager = Manager::open(state_dir)?;
    let record = manager.get_run(target)?;
    let runtime_inspect = manager.runtime_inspect(&record);

    if json {
        let mut payload = serde_json::json!({ "run": record });
        match &runtime_inspect {
            Ok(raw) => payload["runtimeInspect"] = serde_json::Value::String(raw.clone()),
            Err(err) => {
                payload["runtimeInspectError"] = serde_json::Value::String(err.to_string());
            }
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("run_id: {}", record.run_id);
    println!("status: {}", record.status);
    println!("runtime: {}", record.runtime_target);
    println!("container: {}", record.container_id);
    if let Err(err) = runtime_inspect {
        println!("runtime inspect error: {err}");
    }
    Ok(())
}
