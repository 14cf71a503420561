//! `metaclaw keygen` - generate an Ed25519 key pair.

use std::path::Path;

use anyhow::{bail, Result};
use metaclaw_core::signing;

/// Generates and writes a key pair, refusing to overwrite without `force`.
pub fn execute(private_key: &Path, public_key: &Path, force: bool) -> Result<()> {
    if !force {
        if private_key.exists() {
            bail!(
                "private key already exists: {} (use --force to overwrite)",
                private_key.display()
            );
        }
        if public_key.exists() {
            bail!(
                "public key already exists: {} (use --force to overwrite)",
                public_key.display()
            );
        }
    }

    let (signing_key, verifying_key) = signing::generate_keypair();
    signing::write_private_key_pem(private_key, &signing_key)?;
    signing::write_public_key_pem(public_key, &verifying_key)?;

    println!("private_key: {}", private_key.display());
    println!("public_key: {}", public_key.display());
    println!("key_id: {}", signing::key_id(&verifying_key));
    Ok(())
}
