//! Ed25519 signing with PEM key files.
//!
//! Private keys are PKCS8 PEM (`PRIVATE KEY`, mode 0600), public keys are
//! SPKI PEM (`PUBLIC KEY`). Signatures are detached, base64-encoded over
//! canonical attestation bytes. The key id is
//! `ed25519:<first 8 bytes of SHA-256(public key) in hex>`.

use std::fs;
use std::path::Path;

use base64::Engine as _;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced by key handling and signature verification.
#[derive(Debug, Error)]
pub enum SigningError {
    /// Filesystem failure on a key or signature file.
    #[error("key io ({path}): {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A PEM document failed to decode as a PKCS8 Ed25519 private key.
    #[error("parse private key {path}: {source}")]
    ParsePrivateKey {
        /// Offending path.
        path: String,
        /// Underlying decode error.
        #[source]
        source: ed25519_dalek::pkcs8::Error,
    },

    /// A PEM document failed to decode as an SPKI Ed25519 public key.
    #[error("parse public key {path}: {source}")]
    ParsePublicKey {
        /// Offending path.
        path: String,
        /// Underlying decode error.
        #[source]
        source: ed25519_dalek::pkcs8::spki::Error,
    },

    /// A key failed to encode to PEM.
    #[error("encode key: {0}")]
    Encode(String),

    /// A detached signature is not valid base64.
    #[error("decode signature: {0}")]
    DecodeSignature(#[from] base64::DecodeError),

    /// A decoded signature has the wrong length.
    #[error("invalid signature length: {0}")]
    SignatureLength(usize),

    /// The signature does not verify over the payload.
    #[error("signature verification failed")]
    Invalid,
}

/// Generates a fresh Ed25519 keypair.
#[must_use]
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut OsRng);
    let verifying = signing.verifying_key();
    (signing, verifying)
}

/// Writes a private key as PKCS8 PEM with mode 0600.
///
/// # Errors
///
/// Encoding or filesystem failures.
pub fn write_private_key_pem(path: &Path, key: &SigningKey) -> Result<(), SigningError> {
    let pem = key
        .to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
        .map_err(|e| SigningError::Encode(e.to_string()))?;
    write_key_file(path, pem.as_bytes(), 0o600)
}

/// Writes a public key as SPKI PEM.
///
/// # Errors
///
/// Encoding or filesystem failures.
pub fn write_public_key_pem(path: &Path, key: &VerifyingKey) -> Result<(), SigningError> {
    let pem = key
        .to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
        .map_err(|e| SigningError::Encode(e.to_string()))?;
    write_key_file(path, pem.as_bytes(), 0o644)
}

/// Loads a PKCS8 PEM private key.
///
/// # Errors
///
/// I/O or decode failures.
pub fn load_private_key_pem(path: &Path) -> Result<SigningKey, SigningError> {
    let pem = read_to_string(path)?;
    SigningKey::from_pkcs8_pem(&pem).map_err(|source| SigningError::ParsePrivateKey {
        path: path.display().to_string(),
        source,
    })
}

/// Loads an SPKI PEM public key.
///
/// # Errors
///
/// I/O or decode failures.
pub fn load_public_key_pem(path: &Path) -> Result<VerifyingKey, SigningError> {
    let pem = read_to_string(path)?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|source| SigningError::ParsePublicKey {
        path: path.display().to_string(),
        source,
    })
}

/// Derives the short key id for a public key.
#[must_use]
pub fn key_id(key: &VerifyingKey) -> String {
    let sum = Sha256::digest(key.as_bytes());
    format!("ed25519:{}", hex::encode(&sum[..8]))
}

/// Signs a payload, returning the detached signature as base64.
#[must_use]
pub fn sign(payload: &[u8], key: &SigningKey) -> String {
    let signature = key.sign(payload);
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Verifies a base64 detached signature over a payload.
///
/// # Errors
///
/// [`SigningError::Invalid`] for a wrong signature; decode errors for
/// malformed base64.
pub fn verify(payload: &[u8], signature_base64: &str, key: &VerifyingKey) -> Result<(), SigningError> {
    let raw = base64::engine::general_purpose::STANDARD.decode(signature_base64.trim())?;
    let bytes: [u8; 64] = raw
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::SignatureLength(raw.len()))?;
    let signature = Signature::from_bytes(&bytes);
    key.verify(payload, &signature)
        .map_err(|_| SigningError::Invalid)
}

fn write_key_file(path: &Path, bytes: &[u8], mode: u32) -> Result<(), SigningError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SigningError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| SigningError::Io {
        path: path.display().to_string(),
        source,
    })?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), SigningError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        SigningError::Io {
            path: path.display().to_string(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), SigningError> {
    Ok(())
}

fn read_to_string(path: &Path) -> Result<String, SigningError> {
    fs::read_to_string(path).map_err(|source| SigningError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let (signing, verifying) = generate_keypair();
        let sig = sign(b"attestation bytes", &signing);
        verify(b"attestation bytes", &sig, &verifying).unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let (signing, verifying) = generate_keypair();
        let sig = sign(b"attestation bytes", &signing);
        assert!(matches!(
            verify(b"attestation bytes!", &sig, &verifying),
            Err(SigningError::Invalid)
        ));
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let (signing, _) = generate_keypair();
        let (_, other_verifying) = generate_keypair();
        let sig = sign(b"payload", &signing);
        assert!(verify(b"payload", &sig, &other_verifying).is_err());
    }

    #[test]
    fn pem_round_trip_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (signing, verifying) = generate_keypair();
        let private_path = dir.path().join("keys/release.pem");
        let public_path = dir.path().join("keys/release.pub.pem");
        write_private_key_pem(&private_path, &signing).unwrap();
        write_public_key_pem(&public_path, &verifying).unwrap();

        let loaded_private = load_private_key_pem(&private_path).unwrap();
        let loaded_public = load_public_key_pem(&public_path).unwrap();
        assert_eq!(loaded_private.to_bytes(), signing.to_bytes());
        assert_eq!(loaded_public.as_bytes(), verifying.as_bytes());

        let pem = std::fs::read_to_string(&private_path).unwrap();
        assert!(pem.contains("BEGIN PRIVATE KEY"));
        let pub_pem = std::fs::read_to_string(&public_path).unwrap();
        assert!(pub_pem.contains("BEGIN PUBLIC KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn private_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let (signing, _) = generate_keypair();
        let path = dir.path().join("key.pem");
        write_private_key_pem(&path, &signing).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn key_id_is_prefixed_short_hash() {
        let (_, verifying) = generate_keypair();
        let id = key_id(&verifying);
        assert!(id.starts_with("ed25519:"));
        assert_eq!(id.len(), "ed25519:".len() + 16);
    }

    #[test]
    fn garbage_base64_is_a_decode_error() {
        let (_, verifying) = generate_keypair();
        assert!(matches!(
            verify(b"p", "!!!not-base64!!!", &verifying),
            Err(SigningError::DecodeSignature(_))
        ));
    }

    #[test]
    fn wrong_length_signature_is_rejected() {
        let (_, verifying) = generate_keypair();
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 10]);
        assert!(matches!(
            verify(b"p", &short, &verifying),
            Err(SigningError::SignatureLength(10))
        ));
    }
}
