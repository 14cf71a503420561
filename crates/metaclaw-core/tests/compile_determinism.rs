//! Compilation determinism: identical inputs yield byte-identical
//! manifests and identical capsule ids, across output locations and input
//! path spellings.

use std::fs;
use std::path::Path;

use metaclaw_core::compiler;

const CLAWFILE: &str = "\
apiVersion: metaclaw/v1
kind: Agent
agent:
  name: determinism
  species: nano
  habitat:
    network:
      mode: none
    env:
      B_SECOND: two
      A_FIRST: one
  command:
    - sh
    - -lc
    - echo deterministic
";

fn write_source_tree(dir: &Path) -> std::path::PathBuf {
    fs::write(dir.join("agent.claw"), CLAWFILE).unwrap();
    fs::write(dir.join("helper.py"), "print('hi')\n").unwrap();
    dir.join("agent.claw")
}

fn manifest_bytes(capsule_path: &Path) -> Vec<u8> {
    fs::read(capsule_path.join("manifest.json")).unwrap()
}

#[test]
fn two_compilations_produce_identical_manifests() {
    let src = tempfile::tempdir().unwrap();
    let clawfile = write_source_tree(src.path());

    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let a = compiler::compile(&clawfile, out_a.path()).unwrap();
    let b = compiler::compile(&clawfile, out_b.path()).unwrap();

    assert_eq!(a.capsule.id, b.capsule.id);
    assert_eq!(manifest_bytes(&a.capsule.path), manifest_bytes(&b.capsule.path));
}

#[test]
fn output_dir_inside_source_root_does_not_change_the_id() {
    let src = tempfile::tempdir().unwrap();
    let clawfile = write_source_tree(src.path());

    let outside = tempfile::tempdir().unwrap();
    let baseline = compiler::compile(&clawfile, outside.path()).unwrap();

    let inside_out = src.path().join("dist");
    fs::create_dir_all(&inside_out).unwrap();
    let inside = compiler::compile(&clawfile, &inside_out).unwrap();

    assert_eq!(baseline.capsule.id, inside.capsule.id);
    assert_eq!(
        manifest_bytes(&baseline.capsule.path),
        manifest_bytes(&inside.capsule.path)
    );
}

#[test]
fn input_path_spelling_does_not_change_the_id() {
    let src = tempfile::tempdir().unwrap();
    let clawfile = write_source_tree(src.path());
    // Same file addressed through a redundant `.` component.
    let spelled = src.path().join(".").join("agent.claw");

    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let direct = compiler::compile(&clawfile, out_a.path()).unwrap();
    let indirect = compiler::compile(&spelled, out_b.path()).unwrap();

    assert_eq!(direct.capsule.id, indirect.capsule.id);
    assert_eq!(
        manifest_bytes(&direct.capsule.path),
        manifest_bytes(&indirect.capsule.path)
    );
}

#[test]
fn recompiling_after_a_source_edit_changes_the_id() {
    let src = tempfile::tempdir().unwrap();
    let clawfile = write_source_tree(src.path());

    let out = tempfile::tempdir().unwrap();
    let before = compiler::compile(&clawfile, out.path()).unwrap();

    fs::write(src.path().join("helper.py"), "print('edited')\n").unwrap();
    let after = compiler::compile(&clawfile, out.path()).unwrap();

    assert_ne!(before.capsule.id, after.capsule.id);
}

#[test]
fn env_map_is_emitted_sorted_in_the_ir() {
    let src = tempfile::tempdir().unwrap();
    let clawfile = write_source_tree(src.path());
    let out = tempfile::tempdir().unwrap();
    let result = compiler::compile(&clawfile, out.path()).unwrap();

    let ir = fs::read_to_string(result.capsule.path.join("ir.json")).unwrap();
    let a = ir.find("A_FIRST").unwrap();
    let b = ir.find("B_SECOND").unwrap();
    assert!(a < b);
}
