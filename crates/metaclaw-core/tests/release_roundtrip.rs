//! Release pipeline end to end: strict gating, signing, verification,
//! tamper detection.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use metaclaw_core::release::{self, CreateOptions, ReleaseError, VerifyOptions};

fn write_clawfile(dir: &Path, network: &str) -> PathBuf {
    let body = format!(
        "\
apiVersion: metaclaw/v1
kind: Agent
agent:
  name: release-agent
  species: nano
  lifecycle: ephemeral
  habitat:
    network:
      mode: {network}
    mounts:
      - source: /var/data
        target: /data
        readOnly: true
  command:
    - sh
    - -lc
    - echo release
"
    );
    let path = dir.join("agent.claw");
    fs::write(&path, body).unwrap();
    path
}

fn create_strict(dir: &Path, network: &str) -> Result<release::CreateResult, ReleaseError> {
    let clawfile = write_clawfile(dir, network);
    release::create(&CreateOptions {
        input_path: clawfile,
        state_dir: dir.join(".metaclaw"),
        output_dir: None,
        strict: true,
        private_key_path: None,
        key_id: None,
    })
}

#[test]
fn strict_release_then_verify_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let created = create_strict(dir.path(), "outbound").unwrap();
    assert!(created.strict_enforced);
    assert!(created.checks.iter().all(|c| c.passed), "{:?}", created.checks);
    assert!(created.release_dir.join("signing/attestation.sig").is_file());
    assert!(created.private_key_path.is_file());

    let verified = release::verify(&VerifyOptions {
        input_path: created.release_dir.clone(),
        public_key_path: None,
        require_release: true,
    })
    .unwrap();
    assert_eq!(verified.kind, "release");
    assert!(verified.verified);
    assert!(verified.signature_valid);
    assert!(verified.strict_satisfied);
    assert_eq!(verified.capsule_id, created.capsule_id);
    assert_eq!(verified.release_id, created.release_id);
}

#[test]
fn network_all_is_rejected_by_strict_mode() {
    let dir = tempfile::tempdir().unwrap();
    let err = create_strict(dir.path(), "all").unwrap_err();
    match err {
        ReleaseError::StrictChecksFailed(names) => {
            assert!(names.contains("habitat.network_not_all"), "{names}");
        }
        other => panic!("expected strict failure, got {other}"),
    }
}

#[test]
fn non_strict_release_records_failing_checks() {
    let dir = tempfile::tempdir().unwrap();
    let clawfile = write_clawfile(dir.path(), "all");
    let created = release::create(&CreateOptions {
        input_path: clawfile,
        state_dir: dir.path().join(".metaclaw"),
        output_dir: None,
        strict: false,
        private_key_path: None,
        key_id: None,
    })
    .unwrap();
    let network_check = created
        .checks
        .iter()
        .find(|c| c.name == "habitat.network_not_all")
        .unwrap();
    assert!(!network_check.passed);
}

#[test]
fn replacing_the_signature_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let created = create_strict(dir.path(), "outbound").unwrap();

    // Any other valid base64 of the right length is still a forgery.
    let forged = base64::engine::general_purpose::STANDARD.encode([7u8; 64]);
    fs::write(created.release_dir.join("signing/attestation.sig"), forged).unwrap();

    let err = release::verify(&VerifyOptions {
        input_path: created.release_dir,
        public_key_path: None,
        require_release: true,
    })
    .unwrap_err();
    assert!(
        err.to_string().contains("signature verification failed"),
        "got {err}"
    );
}

#[test]
fn tampered_attestation_digest_is_caught() {
    let dir = tempfile::tempdir().unwrap();
    let created = create_strict(dir.path(), "outbound").unwrap();

    let provenance_path = created.release_dir.join("provenance.json");
    let mut bytes = fs::read(&provenance_path).unwrap();
    bytes.push(b' ');
    fs::write(&provenance_path, bytes).unwrap();

    let err = release::verify(&VerifyOptions {
        input_path: created.release_dir,
        public_key_path: None,
        require_release: true,
    })
    .unwrap_err();
    assert!(matches!(err, ReleaseError::DigestMismatch { .. }), "got {err}");
}

#[test]
fn bare_capsule_verification_reports_integrity_only() {
    let dir = tempfile::tempdir().unwrap();
    let created = create_strict(dir.path(), "outbound").unwrap();

    let verified = release::verify(&VerifyOptions {
        input_path: created.capsule_path.clone(),
        public_key_path: None,
        require_release: false,
    })
    .unwrap();
    assert_eq!(verified.kind, "capsule");
    assert!(verified.verified);
    assert!(!verified.signature_valid);

    let err = release::verify(&VerifyOptions {
        input_path: created.capsule_path,
        public_key_path: None,
        require_release: true,
    })
    .unwrap_err();
    assert!(matches!(err, ReleaseError::ReleaseNotFound(_)));
}

#[test]
fn signing_key_is_reused_across_releases() {
    let dir = tempfile::tempdir().unwrap();
    let first = create_strict(dir.path(), "outbound").unwrap();
    let key_bytes = fs::read(&first.private_key_path).unwrap();

    let second = create_strict(dir.path(), "outbound").unwrap();
    assert_eq!(first.private_key_path, second.private_key_path);
    assert_eq!(key_bytes, fs::read(&second.private_key_path).unwrap());
    assert_eq!(
        first.release_manifest.signing.key_id,
        second.release_manifest.signing.key_id
    );
}
