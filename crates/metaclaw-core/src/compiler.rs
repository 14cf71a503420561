//! The capsule compiler: parse → normalize → policy → locks → capsule.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capsule::{self, Capsule, CapsuleError};
use crate::claw::parse::{self, ParseError};
use crate::claw::schema::{Clawfile, RuntimeTarget};
use crate::claw::validate::{self, ValidateError};
use crate::locks::{self, BundleLocks, LockError};
use crate::policy::{self, Policy};

/// Version tag written into `ir.json`.
pub const IR_VERSION: &str = "metaclaw.ir/v1";

/// The IR document stored in a capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ir {
    /// [`IR_VERSION`].
    pub version: String,
    /// The normalized clawfile.
    pub clawfile: Clawfile,
    /// Resolved runtime summary.
    pub runtime: IrRuntime,
    /// Always the literal `.`, so absolute and relative compile paths
    /// produce identical capsules.
    pub source_root: String,
}

/// Runtime summary inside the IR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrRuntime {
    /// Declared backend, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RuntimeTarget>,
    /// The digest-pinned image.
    pub image: String,
}

/// Everything a compilation produces.
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Normalized clawfile.
    pub config: Clawfile,
    /// Compiled policy.
    pub policy: Policy,
    /// Generated locks.
    pub locks: BundleLocks,
    /// Written capsule.
    pub capsule: Capsule,
}

/// Errors produced by the compile pipeline.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Clawfile could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Clawfile failed normalization/validation.
    #[error(transparent)]
    Validate(#[from] ValidateError),

    /// Lock generation failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Capsule write failed.
    #[error("write capsule: {0}")]
    Capsule(#[from] CapsuleError),
}

/// Parses and normalizes a clawfile without compiling it.
///
/// # Errors
///
/// Parse or validation errors.
pub fn load_normalize(path: &Path) -> Result<Clawfile, CompileError> {
    let cfg = parse::parse_file(path)?;
    Ok(validate::normalize_and_validate(cfg, path)?)
}

/// Compiles a clawfile into a capsule under `output_dir`.
///
/// # Errors
///
/// Any pipeline stage error; a partially written capsule directory is left
/// on disk for inspection.
pub fn compile(path: &Path, output_dir: &Path) -> Result<CompileResult, CompileError> {
    let config = load_normalize(path)?;
    let pol = policy::compile(&config);
    let lk = locks::generate(&config, path, output_dir)?;

    let ir = Ir {
        version: IR_VERSION.to_string(),
        clawfile: config.clone(),
        runtime: IrRuntime {
            target: config.agent.runtime.target,
            image: config.agent.image().to_string(),
        },
        source_root: ".".to_string(),
    };

    let capsule = capsule::write(output_dir, path, &ir, &pol, &lk)?;
    debug!(capsule_id = %capsule.id, path = %capsule.path.display(), "capsule written");
    Ok(CompileResult {
        config,
        policy: pol,
        locks: lk,
        capsule,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const CLAWFILE: &str = "\
apiVersion: metaclaw/v1
kind: Agent
agent:
  name: compile-test
  species: nano
  habitat:
    network:
      mode: none
";

    #[test]
    fn compile_produces_verified_capsule() {
        let dir = tempfile::tempdir().unwrap();
        let clawfile = dir.path().join("agent.claw");
        fs::write(&clawfile, CLAWFILE).unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();

        let res = compile(&clawfile, &out).unwrap();
        assert_eq!(res.capsule.manifest.source_clawfile, "agent.claw");
        // Loading re-verifies every digest.
        let manifest = crate::capsule::load(&res.capsule.path).unwrap();
        assert_eq!(manifest.capsule_id, res.capsule.id);
    }

    #[test]
    fn ir_records_stable_source_root() {
        let dir = tempfile::tempdir().unwrap();
        let clawfile = dir.path().join("agent.claw");
        fs::write(&clawfile, CLAWFILE).unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();

        let res = compile(&clawfile, &out).unwrap();
        let ir: serde_json::Value =
            serde_json::from_slice(&fs::read(res.capsule.path.join("ir.json")).unwrap()).unwrap();
        assert_eq!(ir["sourceRoot"], ".");
        assert_eq!(ir["version"], IR_VERSION);
        assert_eq!(ir["clawfile"]["agent"]["name"], "compile-test");
    }
}
