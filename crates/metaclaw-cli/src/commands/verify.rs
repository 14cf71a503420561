//! `metaclaw verify` - verify a release or capsule directory.

use std::path::Path;

use anyhow::Result;
use metaclaw_core::release::{self, VerifyOptions};

/// Verifies the input and reports what held.
pub fn execute(
    input: &Path,
    public_key: Option<&Path>,
    require_release: bool,
    json: bool,
) -> Result<()> {
    let result = release::verify(&VerifyOptions {
        input_path: input.to_path_buf(),
        public_key_path: public_key.map(Path::to_path_buf),
        require_release,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("kind: {}", result.kind);
    println!("verified: {}", result.verified);
    if !result.release_id.is_empty() {
        println!("release_id: {}", result.release_id);
    }
    println!("capsule_id: {}", result.capsule_id);
    println!("signature_valid: {}", result.signature_valid);
    println!("strict_satisfied: {}", result.strict_satisfied);
    for check in &result.checks {
        let status = if check.passed { "OK" } else { "FAIL" };
        println!("check[{}]: {} ({})", check.name, status, check.details);
    }
    Ok(())
}
