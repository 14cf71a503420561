//! `metaclaw release` - produce a signed release bundle.

use std::path::PathBuf;

use anyhow::Result;
use metaclaw_core::release::{self, CreateOptions};

/// Arguments for `metaclaw release`.
#[derive(Debug)]
pub struct ReleaseArgs {
    /// Clawfile or capsule directory.
    pub input: PathBuf,
    /// Enforce strict checks.
    pub strict: bool,
    /// State directory.
    pub state_dir: PathBuf,
    /// Output directory root.
    pub out: Option<PathBuf>,
    /// Signing key path.
    pub sign_key: Option<PathBuf>,
    /// Key id override.
    pub key_id: Option<String>,
    /// JSON output.
    pub json: bool,
}

/// Creates the release and reports the artifacts and check results.
pub fn execute(args: &ReleaseArgs) -> Result<()> {
    let result = release::create(&CreateOptions {
        input_path: args.input.clone(),
        state_dir: args.state_dir.clone(),
        output_dir: args.out.clone(),
        strict: args.strict,
        private_key_path: args.sign_key.clone(),
        key_id: args.key_id.clone(),
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("release_dir: {}", result.release_dir.display());
    println!("release_id: {}", result.release_id);
    println!("capsule_id: {}", result.capsule_id);
    println!("capsule_path: {}", result.capsule_path.display());
    println!("strict: {}", result.strict_enforced);
    println!("sign_key: {}", result.private_key_path.display());
    println!("public_key: {}", result.public_key_path.display());
    println!("key_id: {}", result.release_manifest.signing.key_id);
    for check in &result.checks {
        let status = if check.passed { "OK" } else { "FAIL" };
        println!("check[{}]: {} ({})", check.name, status, check.details);
    }
    Ok(())
}
