//! Capsule write and load: the content-addressed bundle.
//!
//! A capsule is a directory `cap_<16-hex>` holding the canonical IR,
//! policy, three locks, a portable run spec, and a manifest mapping each
//! logical artifact to its digest. The capsule id is derived from the
//! digests alone, so identical inputs always land in the same directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::canonical::{digest, to_canonical_json};
use crate::locks::BundleLocks;
use crate::policy::Policy;

/// Version tag written into `manifest.json`.
pub const MANIFEST_VERSION: &str = "metaclaw.capsule/v1";

/// Version tag written into `compat/portable-run-spec.json`.
pub const PORTABLE_VERSION: &str = "metaclaw.portable/v1";

/// Capsule manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// [`MANIFEST_VERSION`].
    pub version: String,
    /// First 16 hex digits of the digest-map hash.
    pub capsule_id: String,
    /// Basename of the compiled clawfile.
    pub source_clawfile: String,
    /// Logical name → `sha256:<hex>` over canonical bytes.
    pub digests: std::collections::BTreeMap<String, String>,
    /// Backends and flag semantics this capsule relies on.
    pub runtime_compatibility: RuntimeContract,
    /// Relative paths of the lock files.
    pub locks: LockManifest,
}

/// Declares which backends and flag semantics the capsule needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContract {
    /// Supported backend names.
    pub targets: Vec<String>,
    /// Flag families the run translation uses.
    pub semantics: Vec<String>,
}

/// Relative lock file paths inside the capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockManifest {
    /// Deps lock path.
    pub dependency: String,
    /// Image lock path.
    pub image: String,
    /// Source lock path.
    pub source: String,
}

/// A written capsule: id, directory, manifest.
#[derive(Debug, Clone)]
pub struct Capsule {
    /// The capsule id.
    pub id: String,
    /// Directory the capsule was written to.
    pub path: PathBuf,
    /// The manifest as written.
    pub manifest: Manifest,
}

/// Errors produced while writing or loading a capsule.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Serialization failure for one of the canonical documents.
    #[error("marshal {what}: {source}")]
    Marshal {
        /// Which document failed.
        what: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Filesystem failure.
    #[error("capsule io ({path}): {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is missing its capsule id.
    #[error("capsule manifest missing capsuleId")]
    MissingCapsuleId,

    /// The manifest has no digest for a required logical name.
    #[error("capsule manifest missing digest for {0}")]
    MissingDigest(String),

    /// A stored artifact no longer matches its manifest digest.
    #[error("capsule digest mismatch for {key}: expected {expected}, got {got}")]
    DigestMismatch {
        /// Logical artifact name.
        key: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest of the bytes on disk.
        got: String,
    },

    /// A manifest path points outside the capsule directory.
    #[error("path escapes capsule root: {0}")]
    PathEscape(String),

    /// A manifest path is absolute.
    #[error("absolute paths are not allowed in capsule manifest: {0}")]
    AbsolutePath(String),

    /// `manifest.json` is not valid JSON.
    #[error("parse capsule manifest: {0}")]
    ParseManifest(#[source] serde_json::Error),
}

/// Computes the capsule id from a digest map: SHA-256 over the sorted
/// `(key, digest)` concatenation, truncated to 16 hex digits.
#[must_use]
pub fn capsule_id(digests: &std::collections::BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in digests {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Writes a capsule under `output_dir`.
///
/// Artifacts are written via temp-file-plus-rename; `manifest.json` goes
/// last so a partially written capsule never carries a valid manifest.
///
/// # Errors
///
/// Returns a [`CapsuleError`] on serialization or filesystem failure.
pub fn write<I: Serialize>(
    output_dir: &Path,
    source_clawfile: &Path,
    ir: &I,
    policy: &Policy,
    locks: &BundleLocks,
) -> Result<Capsule, CapsuleError> {
    let ir_json = marshal("ir", ir)?;
    let policy_json = marshal("policy", policy)?;
    let deps_json = marshal("deps lock", &locks.deps)?;
    let image_json = marshal("image lock", &locks.image)?;
    let source_json = marshal("source lock", &locks.source)?;

    let mut digests = std::collections::BTreeMap::new();
    digests.insert("ir".to_string(), digest(&ir_json));
    digests.insert("policy".to_string(), digest(&policy_json));
    digests.insert("deps".to_string(), digest(&deps_json));
    digests.insert("image".to_string(), digest(&image_json));
    digests.insert("source".to_string(), digest(&source_json));
    let id = capsule_id(&digests);

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        capsule_id: id.clone(),
        source_clawfile: source_clawfile
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
        digests,
        runtime_compatibility: RuntimeContract {
            targets: vec![
                "podman".to_string(),
                "apple_container".to_string(),
                "docker".to_string(),
            ],
            semantics: vec![
                "detach".to_string(),
                "env".to_string(),
                "volume".to_string(),
                "workdir".to_string(),
            ],
        },
        locks: LockManifest {
            dependency: "locks/deps.lock.json".to_string(),
            image: "locks/image.lock.json".to_string(),
            source: "locks/source.lock.json".to_string(),
        },
    };
    let manifest_json = marshal("manifest", &manifest)?;

    let portable = serde_json::json!({
        "version": PORTABLE_VERSION,
        "image": locks.image.image,
        "network": policy.network.mode,
        "mounts": policy.mounts,
    });
    let portable_json = marshal("portable spec", &portable)?;

    let cap_path = output_dir.join(format!("cap_{id}"));
    create_dir_all(&cap_path.join("locks"))?;
    create_dir_all(&cap_path.join("compat"))?;

    write_atomic(&cap_path.join("ir.json"), &ir_json)?;
    write_atomic(&cap_path.join("policy.json"), &policy_json)?;
    write_atomic(&cap_path.join("locks/deps.lock.json"), &deps_json)?;
    write_atomic(&cap_path.join("locks/image.lock.json"), &image_json)?;
    write_atomic(&cap_path.join("locks/source.lock.json"), &source_json)?;
    write_atomic(&cap_path.join("compat/portable-run-spec.json"), &portable_json)?;
    write_atomic(&cap_path.join("manifest.json"), &manifest_json)?;

    Ok(Capsule {
        id,
        path: cap_path,
        manifest,
    })
}

/// Loads a capsule directory and verifies every artifact digest.
///
/// # Errors
///
/// [`CapsuleError::DigestMismatch`] when any artifact was mutated,
/// [`CapsuleError::PathEscape`]/[`CapsuleError::AbsolutePath`] on manifest
/// path traversal, I/O and parse errors otherwise.
pub fn load(path: &Path) -> Result<Manifest, CapsuleError> {
    let manifest_path = path.join("manifest.json");
    let bytes = read(&manifest_path)?;
    let manifest: Manifest =
        serde_json::from_slice(&bytes).map_err(CapsuleError::ParseManifest)?;
    verify_manifest(path, &manifest)?;
    Ok(manifest)
}

fn verify_manifest(base: &Path, manifest: &Manifest) -> Result<(), CapsuleError> {
    if manifest.capsule_id.is_empty() {
        return Err(CapsuleError::MissingCapsuleId);
    }
    let required = [
        ("ir", "ir.json".to_string()),
        ("policy", "policy.json".to_string()),
        ("deps", manifest.locks.dependency.clone()),
        ("image", manifest.locks.image.clone()),
        ("source", manifest.locks.source.clone()),
    ];
    for (key, rel_path) in required {
        let expected = manifest
            .digests
            .get(key)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CapsuleError::MissingDigest(key.to_string()))?;
        let abs = resolve_capsule_path(base, &rel_path)?;
        let bytes = read(&abs)?;
        let got = digest(&bytes);
        if &got != expected {
            return Err(CapsuleError::DigestMismatch {
                key: key.to_string(),
                expected: expected.clone(),
                got,
            });
        }
    }
    Ok(())
}

/// Resolves a manifest-relative path, refusing absolute paths and any
/// cleaned path that would leave the capsule directory.
fn resolve_capsule_path(base: &Path, rel: &str) -> Result<PathBuf, CapsuleError> {
    if rel.is_empty() {
        return Err(CapsuleError::PathEscape(rel.to_string()));
    }
    if Path::new(rel).is_absolute() {
        return Err(CapsuleError::AbsolutePath(rel.to_string()));
    }
    // Clean the path textually: traversal must be caught even when the
    // target does not exist.
    let mut depth = 0i32;
    for segment in rel.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return Err(CapsuleError::PathEscape(rel.to_string()));
                }
            }
            _ => depth += 1,
        }
    }
    if depth == 0 {
        return Err(CapsuleError::PathEscape(rel.to_string()));
    }
    Ok(base.join(rel))
}

fn marshal<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, CapsuleError> {
    to_canonical_json(value).map_err(|source| CapsuleError::Marshal { what, source })
}

fn read(path: &Path) -> Result<Vec<u8>, CapsuleError> {
    fs::read(path).map_err(|source| CapsuleError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn create_dir_all(path: &Path) -> Result<(), CapsuleError> {
    fs::create_dir_all(path).map_err(|source| CapsuleError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Temp-file-plus-rename write so readers never observe partial bytes.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CapsuleError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|source| CapsuleError::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| CapsuleError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::claw::parse::parse_bytes;
    use crate::claw::validate::normalize_and_validate;
    use crate::{locks, policy};

    fn write_test_capsule(dir: &Path) -> Capsule {
        let src = dir.join("src");
        fs::create_dir_all(&src).unwrap();
        let clawfile = src.join("agent.claw");
        fs::write(
            &clawfile,
            "apiVersion: metaclaw/v1\nkind: Agent\nagent:\n  name: cap\n  species: nano\n",
        )
        .unwrap();
        let cfg = parse_bytes(&fs::read(&clawfile).unwrap(), "agent.claw").unwrap();
        let cfg = normalize_and_validate(cfg, &clawfile).unwrap();
        let pol = policy::compile(&cfg);
        let out = dir.join("out");
        fs::create_dir_all(&out).unwrap();
        let lk = locks::generate(&cfg, &clawfile, &out).unwrap();
        let ir = serde_json::json!({
            "version": "metaclaw.ir/v1",
            "clawfile": cfg,
            "sourceRoot": ".",
        });
        write(&out, &clawfile, &ir, &pol, &lk).unwrap()
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let capsule = write_test_capsule(dir.path());
        assert_eq!(capsule.id.len(), 16);
        assert!(capsule.path.ends_with(format!("cap_{}", capsule.id)));

        let manifest = load(&capsule.path).unwrap();
        assert_eq!(manifest.capsule_id, capsule.id);
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.digests.len(), 5);
    }

    #[test]
    fn mutating_an_artifact_names_the_logical_key() {
        let dir = tempfile::tempdir().unwrap();
        let capsule = write_test_capsule(dir.path());

        let policy_path = capsule.path.join("policy.json");
        let mut bytes = fs::read(&policy_path).unwrap();
        bytes.push(b' ');
        fs::write(&policy_path, bytes).unwrap();

        let err = load(&capsule.path).unwrap_err();
        match err {
            CapsuleError::DigestMismatch { key, .. } => assert_eq!(key, "policy"),
            other => panic!("expected digest mismatch, got {other}"),
        }
    }

    #[test]
    fn traversal_in_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let capsule = write_test_capsule(dir.path());

        let manifest_path = capsule.path.join("manifest.json");
        let text = fs::read_to_string(&manifest_path)
            .unwrap()
            .replace("locks/deps.lock.json", "../deps.lock.json");
        fs::write(&manifest_path, text).unwrap();

        let err = load(&capsule.path).unwrap_err();
        assert!(matches!(err, CapsuleError::PathEscape(_)), "got {err}");
    }

    #[test]
    fn absolute_manifest_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let capsule = write_test_capsule(dir.path());

        let manifest_path = capsule.path.join("manifest.json");
        let text = fs::read_to_string(&manifest_path)
            .unwrap()
            .replace("locks/deps.lock.json", "/etc/passwd");
        fs::write(&manifest_path, text).unwrap();

        assert!(matches!(
            load(&capsule.path),
            Err(CapsuleError::AbsolutePath(_))
        ));
    }

    #[test]
    fn capsule_id_is_stable_over_key_order() {
        let mut a = std::collections::BTreeMap::new();
        a.insert("ir".to_string(), "sha256:1".to_string());
        a.insert("policy".to_string(), "sha256:2".to_string());
        let id = capsule_id(&a);
        assert_eq!(id.len(), 16);
        assert_eq!(id, capsule_id(&a.clone()));
    }
}
