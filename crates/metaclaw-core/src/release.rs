//! Release pipeline: strict checks, provenance, attestation, signing.
//!
//! A release is a sibling directory `rel_<16-hex>` holding a copy of the
//! capsule, `release.json`, `provenance.json`, `attestation.json`, a
//! detached Ed25519 signature over the canonical attestation bytes, and
//! the public key. Verification re-checks capsule integrity, the three
//! attestation digests, the signature, and (for strict releases) re-runs
//! every strict check.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::canonical::{digest, to_canonical_json};
use crate::capsule::{self, CapsuleError};
use crate::claw::schema::{Clawfile, NetworkMode};
use crate::claw::validate::is_normalized_absolute;
use crate::compiler::{self, CompileError};
use crate::locks::SourceLock;
use crate::policy::Policy;
use crate::signing::{self, SigningError};
use crate::store::now_rfc3339;

/// Version tag written into `release.json`.
pub const RELEASE_VERSION: &str = "metaclaw.release/v1";

/// Version tag written into `attestation.json`.
pub const ATTESTATION_VERSION: &str = "metaclaw.attestation/v1";

/// Version tag written into `provenance.json`.
pub const PROVENANCE_VERSION: &str = "metaclaw.provenance/v1";

/// Options for [`create`].
#[derive(Debug, Default, Clone)]
pub struct CreateOptions {
    /// `.claw` file or capsule directory.
    pub input_path: PathBuf,
    /// State directory (default `.metaclaw`).
    pub state_dir: PathBuf,
    /// Release output root; defaults to `<state-dir>/releases`.
    pub output_dir: Option<PathBuf>,
    /// Abort on any failed strict check.
    pub strict: bool,
    /// Signing key path; auto-generated under `<state-dir>/keys/` when
    /// unset.
    pub private_key_path: Option<PathBuf>,
    /// Key id override.
    pub key_id: Option<String>,
}

/// What [`create`] produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResult {
    /// Release directory.
    pub release_dir: PathBuf,
    /// Release id.
    pub release_id: String,
    /// Capsule id the release wraps.
    pub capsule_id: String,
    /// The embedded capsule copy.
    pub capsule_path: PathBuf,
    /// Whether the input was compiled into a fresh capsule.
    pub created_capsule: bool,
    /// Signing key used.
    pub private_key_path: PathBuf,
    /// Public key embedded in the release.
    pub public_key_path: PathBuf,
    /// Evaluated strict checks.
    pub checks: Vec<StrictCheck>,
    /// Whether strict mode was enforced.
    pub strict_enforced: bool,
    /// The release manifest as written.
    pub release_manifest: ReleaseManifest,
}

/// Options for [`verify`].
#[derive(Debug, Default, Clone)]
pub struct VerifyOptions {
    /// Release or capsule directory.
    pub input_path: PathBuf,
    /// Public key override.
    pub public_key_path: Option<PathBuf>,
    /// Fail unless the input is a release directory.
    pub require_release: bool,
}

/// What [`verify`] established.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    /// `release` or `capsule`.
    pub kind: String,
    /// Overall verdict; verification errors abort instead.
    pub verified: bool,
    /// Release id, empty for bare capsules.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub release_id: String,
    /// Capsule id.
    pub capsule_id: String,
    /// Release directory, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_path: Option<PathBuf>,
    /// Capsule directory inspected.
    pub capsule_path: PathBuf,
    /// Whether the detached signature verified.
    pub signature_valid: bool,
    /// Whether a strict release still satisfies its checks.
    pub strict_satisfied: bool,
    /// Evaluated checks.
    pub checks: Vec<StrictCheck>,
}

/// `release.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    /// [`RELEASE_VERSION`].
    pub version: String,
    /// Release id.
    pub release_id: String,
    /// RFC3339 creation time.
    pub created_at: String,
    /// Whether strict mode was enforced at creation.
    pub strict: bool,
    /// Embedded capsule description.
    pub capsule: ReleaseCapsule,
    /// Relative artifact paths.
    pub artifacts: ReleaseArtifacts,
    /// Signing metadata.
    pub signing: ReleaseSigning,
    /// Strict checks evaluated at creation.
    pub checks: Vec<StrictCheck>,
}

/// Capsule block of the release manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCapsule {
    /// Capsule id.
    pub id: String,
    /// Relative path of the capsule copy.
    pub path: String,
    /// Basename of the compiled clawfile.
    pub source_clawfile: String,
}

/// Artifact paths inside the release directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseArtifacts {
    /// Provenance document.
    pub provenance: String,
    /// Attestation document.
    pub attestation: String,
    /// Detached signature.
    pub signature: String,
}

/// Signing block of the release manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSigning {
    /// Always `ed25519`.
    pub algorithm: String,
    /// Key id the attestation was signed under.
    pub key_id: String,
    /// Relative path of the embedded public key.
    pub public_key: String,
}

/// `attestation.json`: the signed statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// [`ATTESTATION_VERSION`].
    pub version: String,
    /// Release id.
    pub release_id: String,
    /// RFC3339 creation time.
    pub created_at: String,
    /// Capsule id.
    pub capsule_id: String,
    /// Whether the release was strict.
    pub strict: bool,
    /// Signing key id.
    pub key_id: String,
    /// Digests of release.json, provenance.json, and the capsule manifest.
    pub digests: BTreeMap<String, String>,
}

/// `provenance.json`: who/where/what produced the release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// [`PROVENANCE_VERSION`].
    pub version: String,
    /// RFC3339 creation time.
    pub created_at: String,
    /// Producing tool name.
    pub tool_name: String,
    /// Producing tool version.
    pub tool_version: String,
    /// Host OS.
    pub host_os: String,
    /// Host architecture.
    pub host_arch: String,
    /// Basename of the compiled clawfile.
    pub source_clawfile: String,
    /// Git commit carried over from the source lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Git tree carried over from the source lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_tree: Option<String>,
    /// Number of files pinned by the source lock.
    pub source_files: usize,
}

/// One named boolean predicate evaluated before signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrictCheck {
    /// Stable check name.
    pub name: String,
    /// Whether the predicate held.
    pub passed: bool,
    /// Human description of the predicate.
    pub details: String,
}

/// Errors produced by the release pipeline.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Filesystem failure.
    #[error("release io ({path}): {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Capsule load/verify failure.
    #[error("capsule verify failed: {0}")]
    Capsule(#[from] CapsuleError),

    /// Compiling a `.claw` input failed.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Key handling or signature failure.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// A document failed to serialize canonically.
    #[error("marshal {what}: {source}")]
    Marshal {
        /// Which document.
        what: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored document failed to decode.
    #[error("parse {what}: {source}")]
    ParseDoc {
        /// Which document.
        what: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// The input is not a `.claw` file or directory.
    #[error("input must be .claw file or capsule directory: {0}")]
    InvalidInput(String),

    /// `--require-release` was set but the input has no release manifest.
    #[error("release manifest not found: {0}")]
    ReleaseNotFound(String),

    /// Strict mode aborted creation.
    #[error("strict checks failed: {0}")]
    StrictChecksFailed(String),

    /// A strict release no longer satisfies its checks.
    #[error("strict checks no longer satisfied: {0}")]
    StrictNoLongerSatisfied(String),

    /// The capsule id disagrees between artifacts.
    #[error("capsule id mismatch: {context}")]
    CapsuleIdMismatch {
        /// Which two artifacts disagree.
        context: String,
    },

    /// An attestation field disagrees with the release manifest.
    #[error("attestation {field} mismatch")]
    AttestationMismatch {
        /// The disagreeing field.
        field: &'static str,
    },

    /// One of the attested digests no longer matches the file on disk.
    #[error("{what} digest mismatch")]
    DigestMismatch {
        /// `release`, `provenance`, or `capsule manifest`.
        what: &'static str,
    },
}

/// Creates a release from a `.claw` file or capsule directory.
///
/// # Errors
///
/// [`ReleaseError::StrictChecksFailed`] in strict mode with failing
/// checks; pipeline errors otherwise.
pub fn create(opts: &CreateOptions) -> Result<CreateResult, ReleaseError> {
    let state_dir = if opts.state_dir.as_os_str().is_empty() {
        PathBuf::from(".metaclaw")
    } else {
        opts.state_dir.clone()
    };
    let output_dir = opts
        .output_dir
        .clone()
        .unwrap_or_else(|| state_dir.join("releases"));

    let (capsule_path, created_capsule) = prepare_capsule(&opts.input_path, &state_dir)?;
    let manifest = capsule::load(&capsule_path)?;

    let (ir, policy, source_lock) = load_capsule_docs(&capsule_path)?;
    let checks = strict_checks(&ir, &policy, &source_lock);
    if opts.strict {
        let failed = failed_checks(&checks);
        if !failed.is_empty() {
            return Err(ReleaseError::StrictChecksFailed(failed.join("; ")));
        }
    }

    create_dir_all(&output_dir)?;
    let release_id = make_release_id(&manifest.capsule_id);
    let release_dir = output_dir.join(format!("rel_{release_id}"));
    create_dir_all(&release_dir)?;

    let release_capsule_path = release_dir.join("capsule");
    copy_dir(&capsule_path, &release_capsule_path)?;

    let private_key_path = opts
        .private_key_path
        .clone()
        .unwrap_or_else(|| state_dir.join("keys").join("release_ed25519.pem"));
    let (signing_key, verifying_key, created_key) = load_or_create_private_key(&private_key_path)?;
    if created_key {
        debug!(path = %private_key_path.display(), "generated signing key");
    }
    let key_id = opts
        .key_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| signing::key_id(&verifying_key));

    let public_key_rel = "signing/public_key.pem";
    let public_key_path = release_dir.join(public_key_rel);
    signing::write_public_key_pem(&public_key_path, &verifying_key)?;

    let created_at = now_rfc3339();
    let release_manifest = ReleaseManifest {
        version: RELEASE_VERSION.to_string(),
        release_id: release_id.clone(),
        created_at: created_at.clone(),
        strict: opts.strict,
        capsule: ReleaseCapsule {
            id: manifest.capsule_id.clone(),
            path: "capsule".to_string(),
            source_clawfile: manifest.source_clawfile.clone(),
        },
        artifacts: ReleaseArtifacts {
            provenance: "provenance.json".to_string(),
            attestation: "attestation.json".to_string(),
            signature: "signing/attestation.sig".to_string(),
        },
        signing: ReleaseSigning {
            algorithm: "ed25519".to_string(),
            key_id: key_id.clone(),
            public_key: public_key_rel.to_string(),
        },
        checks: checks.clone(),
    };
    let release_json = marshal("release manifest", &release_manifest)?;
    write_file(&release_dir.join("release.json"), &release_json)?;

    let provenance = build_provenance(&created_at, &manifest.source_clawfile, &source_lock);
    let provenance_json = marshal("provenance", &provenance)?;
    write_file(&release_dir.join("provenance.json"), &provenance_json)?;

    let capsule_manifest_json = read_file(&release_capsule_path.join("manifest.json"))?;
    let mut digests = BTreeMap::new();
    digests.insert("release".to_string(), digest(&release_json));
    digests.insert("provenance".to_string(), digest(&provenance_json));
    digests.insert(
        "capsule_manifest".to_string(),
        digest(&capsule_manifest_json),
    );

    let attestation = Attestation {
        version: ATTESTATION_VERSION.to_string(),
        release_id: release_id.clone(),
        created_at,
        capsule_id: manifest.capsule_id.clone(),
        strict: opts.strict,
        key_id,
        digests,
    };
    let attestation_json = marshal("attestation", &attestation)?;
    write_file(&release_dir.join("attestation.json"), &attestation_json)?;

    let signature = signing::sign(&attestation_json, &signing_key);
    create_dir_all(&release_dir.join("signing"))?;
    write_file(
        &release_dir.join("signing/attestation.sig"),
        signature.as_bytes(),
    )?;

    Ok(CreateResult {
        release_dir,
        release_id,
        capsule_id: manifest.capsule_id,
        capsule_path: release_capsule_path,
        created_capsule,
        private_key_path,
        public_key_path,
        checks,
        strict_enforced: opts.strict,
        release_manifest,
    })
}

/// Verifies a release directory or a bare capsule directory.
///
/// # Errors
///
/// Any integrity, signature, or strict-check violation.
pub fn verify(opts: &VerifyOptions) -> Result<VerifyResult, ReleaseError> {
    let meta = fs::metadata(&opts.input_path).map_err(|source| ReleaseError::Io {
        path: opts.input_path.display().to_string(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ReleaseError::InvalidInput(
            opts.input_path.display().to_string(),
        ));
    }

    let release_manifest_path = opts.input_path.join("release.json");
    if release_manifest_path.is_file() {
        return verify_release_dir(opts);
    }
    if opts.require_release {
        return Err(ReleaseError::ReleaseNotFound(
            release_manifest_path.display().to_string(),
        ));
    }

    let manifest = capsule::load(&opts.input_path)?;
    Ok(VerifyResult {
        kind: "capsule".to_string(),
        verified: true,
        release_id: String::new(),
        capsule_id: manifest.capsule_id,
        release_path: None,
        capsule_path: opts.input_path.clone(),
        signature_valid: false,
        strict_satisfied: true,
        checks: vec![StrictCheck {
            name: "capsule.digest_integrity".to_string(),
            passed: true,
            details: "manifest and artifact digests verified".to_string(),
        }],
    })
}

fn verify_release_dir(opts: &VerifyOptions) -> Result<VerifyResult, ReleaseError> {
    let root = &opts.input_path;
    let release_json = read_file(&root.join("release.json"))?;
    let release: ReleaseManifest =
        serde_json::from_slice(&release_json).map_err(|source| ReleaseError::ParseDoc {
            what: "release manifest",
            source,
        })?;

    let capsule_path = root.join(&release.capsule.path);
    let manifest = capsule::load(&capsule_path)?;
    if manifest.capsule_id != release.capsule.id {
        return Err(ReleaseError::CapsuleIdMismatch {
            context: format!(
                "release={} capsule={}",
                release.capsule.id, manifest.capsule_id
            ),
        });
    }

    let provenance_json = read_file(&root.join(&release.artifacts.provenance))?;
    let attestation_json = read_file(&root.join(&release.artifacts.attestation))?;
    let signature_raw = read_file(&root.join(&release.artifacts.signature))?;

    let attestation: Attestation =
        serde_json::from_slice(&attestation_json).map_err(|source| ReleaseError::ParseDoc {
            what: "attestation",
            source,
        })?;
    if attestation.capsule_id != manifest.capsule_id {
        return Err(ReleaseError::AttestationMismatch {
            field: "capsule id",
        });
    }
    if attestation.release_id != release.release_id {
        return Err(ReleaseError::AttestationMismatch {
            field: "release id",
        });
    }
    if attestation.strict != release.strict {
        return Err(ReleaseError::AttestationMismatch { field: "strict" });
    }
    if !release.signing.key_id.is_empty() && attestation.key_id != release.signing.key_id {
        return Err(ReleaseError::AttestationMismatch { field: "key id" });
    }
    if attestation.digests.get("release") != Some(&digest(&release_json)) {
        return Err(ReleaseError::DigestMismatch { what: "release" });
    }
    if attestation.digests.get("provenance") != Some(&digest(&provenance_json)) {
        return Err(ReleaseError::DigestMismatch { what: "provenance" });
    }
    let capsule_manifest_json = read_file(&capsule_path.join("manifest.json"))?;
    if attestation.digests.get("capsule_manifest") != Some(&digest(&capsule_manifest_json)) {
        return Err(ReleaseError::DigestMismatch {
            what: "capsule manifest",
        });
    }

    let public_key_path = opts
        .public_key_path
        .clone()
        .unwrap_or_else(|| root.join(&release.signing.public_key));
    let public_key = signing::load_public_key_pem(&public_key_path)?;

    let canonical_attestation = marshal("attestation", &attestation)?;
    signing::verify(
        &canonical_attestation,
        String::from_utf8_lossy(&signature_raw).trim(),
        &public_key,
    )?;

    let (ir, policy, source_lock) = load_capsule_docs(&capsule_path)?;
    let checks = strict_checks(&ir, &policy, &source_lock);
    let failed = failed_checks(&checks);
    if release.strict && !failed.is_empty() {
        return Err(ReleaseError::StrictNoLongerSatisfied(failed.join("; ")));
    }

    Ok(VerifyResult {
        kind: "release".to_string(),
        verified: true,
        release_id: release.release_id,
        capsule_id: manifest.capsule_id,
        release_path: Some(root.clone()),
        capsule_path,
        signature_valid: true,
        strict_satisfied: !release.strict || failed.is_empty(),
        checks,
    })
}

/// IR view the strict checks need.
#[derive(Debug, Deserialize)]
struct IrDoc {
    clawfile: Clawfile,
    #[serde(default)]
    runtime: IrRuntimeDoc,
}

#[derive(Debug, Default, Deserialize)]
struct IrRuntimeDoc {
    #[serde(default)]
    image: String,
}

fn prepare_capsule(
    input_path: &Path,
    state_dir: &Path,
) -> Result<(PathBuf, bool), ReleaseError> {
    let meta = fs::metadata(input_path).map_err(|source| ReleaseError::Io {
        path: input_path.display().to_string(),
        source,
    })?;
    if meta.is_dir() {
        // Validates integrity before we copy anything.
        capsule::load(input_path)?;
        return Ok((input_path.to_path_buf(), false));
    }
    if input_path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("claw"))
    {
        let capsule_root = state_dir.join("capsules");
        create_dir_all(&capsule_root)?;
        let result = compiler::compile(input_path, &capsule_root)?;
        return Ok((result.capsule.path, true));
    }
    Err(ReleaseError::InvalidInput(
        input_path.display().to_string(),
    ))
}

fn load_capsule_docs(
    capsule_path: &Path,
) -> Result<(IrDoc, Policy, SourceLock), ReleaseError> {
    let ir_bytes = read_file(&capsule_path.join("ir.json"))?;
    let ir: IrDoc = serde_json::from_slice(&ir_bytes)
        .map_err(|source| ReleaseError::ParseDoc { what: "ir", source })?;
    let policy_bytes = read_file(&capsule_path.join("policy.json"))?;
    let policy: Policy = serde_json::from_slice(&policy_bytes).map_err(|source| {
        ReleaseError::ParseDoc {
            what: "policy",
            source,
        }
    })?;
    let source_bytes = read_file(&capsule_path.join("locks/source.lock.json"))?;
    let source_lock: SourceLock = serde_json::from_slice(&source_bytes).map_err(|source| {
        ReleaseError::ParseDoc {
            what: "source lock",
            source,
        }
    })?;
    Ok((ir, policy, source_lock))
}

fn strict_checks(ir: &IrDoc, policy: &Policy, source: &SourceLock) -> Vec<StrictCheck> {
    let mut checks = Vec::with_capacity(8);

    let image = {
        let from_clawfile = ir.clawfile.agent.image().trim();
        if from_clawfile.is_empty() {
            ir.runtime.image.trim()
        } else {
            from_clawfile
        }
    };
    checks.push(StrictCheck {
        name: "runtime.image_digest_pinned".to_string(),
        passed: image.contains("@sha256:"),
        details: "runtime.image must be digest-pinned".to_string(),
    });

    checks.push(StrictCheck {
        name: "habitat.network_not_all".to_string(),
        passed: policy.network.mode != NetworkMode::All,
        details: "strict mode forbids network=all".to_string(),
    });

    let mut sources_absolute = true;
    let mut targets_absolute = true;
    let mut targets_clean = true;
    for mount in &policy.mounts {
        let source_path = mount.source.trim();
        if !source_path.starts_with('/') {
            sources_absolute = false;
        }
        let target = mount.target.trim();
        if !target.starts_with('/') {
            targets_absolute = false;
        }
        if !is_normalized_absolute(target) {
            targets_clean = false;
        }
    }
    checks.push(StrictCheck {
        name: "habitat.mount_sources_absolute".to_string(),
        passed: sources_absolute,
        details: "all mount sources must be absolute host paths".to_string(),
    });
    checks.push(StrictCheck {
        name: "habitat.mount_targets_absolute".to_string(),
        passed: targets_absolute,
        details: "all mount targets must be absolute container paths".to_string(),
    });
    checks.push(StrictCheck {
        name: "habitat.mount_targets_clean".to_string(),
        passed: targets_clean,
        details: "mount targets must be normalized paths".to_string(),
    });

    let relative_ok = source.files.iter().all(|file| {
        let rel = file.path.trim();
        !rel.is_empty()
            && !rel.starts_with('/')
            && rel != ".."
            && !rel.starts_with("../")
            && !rel.split('/').any(|segment| segment == "..")
    });
    checks.push(StrictCheck {
        name: "source_lock_non_empty".to_string(),
        passed: !source.files.is_empty(),
        details: "source.lock must contain at least one file".to_string(),
    });
    checks.push(StrictCheck {
        name: "source_lock_relative_paths".to_string(),
        passed: relative_ok,
        details: "source.lock paths must be relative and stay within source root".to_string(),
    });

    checks.push(StrictCheck {
        name: "llm_key_runtime_injection_only".to_string(),
        passed: llm_key_not_inlined(&ir.clawfile),
        details: "clawfile habitat.env must not inline configured llm api key env variable"
            .to_string(),
    });

    checks
}

/// Keys must arrive at run time; a clawfile that bakes the configured
/// apiKeyEnv into habitat env fails strict mode.
fn llm_key_not_inlined(cfg: &Clawfile) -> bool {
    if cfg.agent.llm.provider.is_none() {
        return true;
    }
    let Some(key_env) = cfg.agent.llm.api_key_env.as_deref().map(str::trim) else {
        return true;
    };
    key_env.is_empty() || !cfg.agent.habitat.env.contains_key(key_env)
}

fn failed_checks(checks: &[StrictCheck]) -> Vec<String> {
    let mut failed: Vec<String> = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.name.clone())
        .collect();
    failed.sort();
    failed
}

fn build_provenance(created_at: &str, source_clawfile: &str, source: &SourceLock) -> Provenance {
    Provenance {
        version: PROVENANCE_VERSION.to_string(),
        created_at: created_at.to_string(),
        tool_name: env!("CARGO_PKG_NAME").to_string(),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        host_os: std::env::consts::OS.to_string(),
        host_arch: std::env::consts::ARCH.to_string(),
        source_clawfile: source_clawfile.to_string(),
        git_commit: source.git_commit.clone(),
        git_tree: source.git_tree.clone(),
        source_files: source.files.len(),
    }
}

fn make_release_id(capsule_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(capsule_id.as_bytes());
    hasher.update(now_rfc3339().as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

fn load_or_create_private_key(
    path: &Path,
) -> Result<(SigningKey, VerifyingKey, bool), ReleaseError> {
    if path.exists() {
        let signing_key = signing::load_private_key_pem(path)?;
        let verifying_key = signing_key.verifying_key();
        return Ok((signing_key, verifying_key, false));
    }
    let (signing_key, verifying_key) = signing::generate_keypair();
    signing::write_private_key_pem(path, &signing_key)?;
    Ok((signing_key, verifying_key, true))
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), ReleaseError> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|err| ReleaseError::Io {
            path: src.display().to_string(),
            source: err.into(),
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target).map_err(|source| ReleaseError::Io {
            path: target.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

fn marshal<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, ReleaseError> {
    to_canonical_json(value).map_err(|source| ReleaseError::Marshal { what, source })
}

fn read_file(path: &Path) -> Result<Vec<u8>, ReleaseError> {
    fs::read(path).map_err(|source| ReleaseError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ReleaseError> {
    fs::write(path, bytes).map_err(|source| ReleaseError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn create_dir_all(path: &Path) -> Result<(), ReleaseError> {
    fs::create_dir_all(path).map_err(|source| ReleaseError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::FileHash;
    use crate::policy::{MountPolicy, NetworkPolicy};

    fn ir_with_network(mode: NetworkMode) -> (IrDoc, Policy, SourceLock) {
        let clawfile: Clawfile = serde_yaml::from_str(
            "apiVersion: metaclaw/v1\nkind: Agent\nagent:\n  name: r\n  species: nano\n",
        )
        .unwrap();
        let ir = IrDoc {
            clawfile,
            runtime: IrRuntimeDoc {
                image: "alpine:3.20@sha256:77726ef25f24bcc9d8e059309a8929574b2f13f0707cde656d2d7b82f83049c4".to_string(),
            },
        };
        let policy = Policy {
            version: crate::policy::POLICY_VERSION.to_string(),
            network: NetworkPolicy {
                mode,
                allowed: mode != NetworkMode::None,
            },
            mounts: vec![MountPolicy {
                source: "/data".to_string(),
                target: "/data".to_string(),
                read_only: true,
            }],
            env_allowlist: Vec::new(),
            workdir: None,
            user: None,
        };
        let source = SourceLock {
            version: crate::locks::SOURCE_LOCK_VERSION.to_string(),
            git_commit: None,
            git_tree: None,
            files: vec![FileHash {
                path: "agent.claw".to_string(),
                sha256: "00".repeat(32),
            }],
        };
        (ir, policy, source)
    }

    #[test]
    fn network_all_fails_its_named_check() {
        let (ir, policy, source) = ir_with_network(NetworkMode::All);
        let checks = strict_checks(&ir, &policy, &source);
        let failed = failed_checks(&checks);
        assert_eq!(failed, vec!["habitat.network_not_all".to_string()]);
    }

    #[test]
    fn clean_capsule_passes_every_check() {
        let (ir, policy, source) = ir_with_network(NetworkMode::Outbound);
        let checks = strict_checks(&ir, &policy, &source);
        assert!(failed_checks(&checks).is_empty(), "{checks:?}");
        assert_eq!(checks.len(), 8);
    }

    #[test]
    fn traversal_in_source_lock_fails_relative_check() {
        let (ir, policy, mut source) = ir_with_network(NetworkMode::None);
        source.files.push(FileHash {
            path: "../escape".to_string(),
            sha256: "00".repeat(32),
        });
        let failed = failed_checks(&strict_checks(&ir, &policy, &source));
        assert!(failed.contains(&"source_lock_relative_paths".to_string()));
    }

    #[test]
    fn empty_source_lock_fails_non_empty_check() {
        let (ir, policy, mut source) = ir_with_network(NetworkMode::None);
        source.files.clear();
        let failed = failed_checks(&strict_checks(&ir, &policy, &source));
        assert!(failed.contains(&"source_lock_non_empty".to_string()));
    }

    #[test]
    fn inlined_llm_key_fails_injection_check() {
        let (mut ir, policy, source) = ir_with_network(NetworkMode::None);
        ir.clawfile.agent.llm.provider =
            Some(crate::claw::schema::LlmProvider::OpenaiCompatible);
        ir.clawfile.agent.llm.api_key_env = Some("OPENAI_API_KEY".to_string());
        ir.clawfile
            .agent
            .habitat
            .env
            .insert("OPENAI_API_KEY".to_string(), "inlined".to_string());
        let failed = failed_checks(&strict_checks(&ir, &policy, &source));
        assert!(failed.contains(&"llm_key_runtime_injection_only".to_string()));
    }

    #[test]
    fn release_id_is_sixteen_hex() {
        let id = make_release_id("deadbeefdeadbeef");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
