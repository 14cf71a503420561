//! Lock generation: content pins for skills, image, and source tree.
//!
//! Three locks are written into every capsule. The deps lock hashes each
//! skill (including its capability contract, so contract edits invalidate
//! the capsule). The image lock hashes the digest-pinned image string. The
//! source lock records a sorted file manifest of the clawfile's directory
//! plus git metadata when a worktree is present.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::canonical::sha256_file;
use crate::capability;
use crate::claw::schema::Clawfile;

/// Version tag for the deps lock.
pub const DEPS_LOCK_VERSION: &str = "metaclaw.depslock/v1";

/// Version tag for the image lock.
pub const IMAGE_LOCK_VERSION: &str = "metaclaw.imagelock/v1";

/// Version tag for the source lock.
pub const SOURCE_LOCK_VERSION: &str = "metaclaw.sourcelock/v1";

/// The three capsule locks together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleLocks {
    /// Skill pins.
    pub deps: DepsLock,
    /// Image pin.
    pub image: ImageLock,
    /// Source tree pin.
    pub source: SourceLock,
}

/// One entry per skill reference, sorted by a stable key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepsLock {
    /// [`DEPS_LOCK_VERSION`].
    pub version: String,
    /// Sorted skill entries.
    #[serde(default)]
    pub skills: Vec<SkillLock>,
}

/// A pinned skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillLock {
    /// Path as written in the clawfile, for path references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Registry id, for id references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Version pin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// `sha256:<hex>` content digest.
    pub digest: String,
}

impl SkillLock {
    fn sort_key(&self) -> String {
        match (&self.path, &self.id) {
            (Some(path), _) => format!("path:{path}"),
            (None, Some(id)) => {
                format!("id:{id}@{}", self.version.as_deref().unwrap_or_default())
            }
            (None, None) => String::new(),
        }
    }
}

/// Image pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLock {
    /// [`IMAGE_LOCK_VERSION`].
    pub version: String,
    /// The digest-pinned image string.
    pub image: String,
    /// `sha256:<hex>` over the image string itself.
    pub digest: String,
}

/// Source tree pin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLock {
    /// [`SOURCE_LOCK_VERSION`].
    pub version: String,
    /// HEAD commit when the source root is a git worktree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// HEAD tree when the source root is a git worktree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_tree: Option<String>,
    /// Sorted file manifest.
    #[serde(default)]
    pub files: Vec<FileHash>,
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// Slash-separated path relative to the source root.
    pub path: String,
    /// Bare hex SHA-256 of the file contents.
    pub sha256: String,
}

/// Errors produced while generating locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// Filesystem failure while walking or hashing.
    #[error("hash source tree: {0}")]
    Io(#[from] std::io::Error),

    /// Walk failure (permission, dangling entry).
    #[error("walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    /// A symlink points outside the source root.
    #[error("symlink {path} escapes the source root")]
    SymlinkEscape {
        /// Slash-separated relative path of the symlink.
        path: String,
    },

    /// A skill path could not be hashed.
    #[error("hash skill path {path}: {reason}")]
    SkillHash {
        /// Path as written in the clawfile.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

/// Generates all three locks for a normalized clawfile.
///
/// `output_dir` is excluded from the source walk when it lives inside the
/// source root, so compiling into a subdirectory stays deterministic.
///
/// # Errors
///
/// Returns a [`LockError`] on any filesystem failure or symlink escape.
pub fn generate(
    cfg: &Clawfile,
    clawfile_path: &Path,
    output_dir: &Path,
) -> Result<BundleLocks, LockError> {
    // A bare file name has the empty string as its parent.
    let source_root = match clawfile_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let deps = build_deps_lock(cfg, source_root)?;
    let image = build_image_lock(cfg);

    let mut excludes = vec![".git".to_string(), ".metaclaw".to_string()];
    if let Some(rel) = relative_if_inside(source_root, output_dir) {
        excludes.push(rel);
    }
    let source = build_source_lock(source_root, &excludes)?;
    Ok(BundleLocks {
        deps,
        image,
        source,
    })
}

fn build_deps_lock(cfg: &Clawfile, base_dir: &Path) -> Result<DepsLock, LockError> {
    let mut skills = Vec::with_capacity(cfg.agent.skills.len());
    for skill in &cfg.agent.skills {
        let mut lock = SkillLock {
            path: skill.path.clone(),
            id: skill.id.clone(),
            version: skill.version.clone(),
            digest: String::new(),
        };
        if let Some(raw) = skill.path.as_deref() {
            let resolved = if Path::new(raw).is_absolute() {
                PathBuf::from(raw)
            } else {
                base_dir.join(raw)
            };
            let digest = hash_skill_path(&resolved).map_err(|e| LockError::SkillHash {
                path: raw.to_string(),
                reason: e.to_string(),
            })?;
            lock.digest = format!("sha256:{digest}");
        } else {
            let id = skill.id.as_deref().unwrap_or_default();
            let version = skill.version.as_deref().unwrap_or_default();
            let mut target = format!("{id}@{version}");
            if let Some(digest) = skill.digest.as_deref().filter(|d| !d.is_empty()) {
                target.push(':');
                target.push_str(digest);
            }
            lock.digest = format!("sha256:{}", hex::encode(Sha256::digest(target.as_bytes())));
        }
        skills.push(lock);
    }
    skills.sort_by_key(SkillLock::sort_key);
    Ok(DepsLock {
        version: DEPS_LOCK_VERSION.to_string(),
        skills,
    })
}

fn build_image_lock(cfg: &Clawfile) -> ImageLock {
    let image = cfg.agent.image().to_string();
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(image.as_bytes())));
    ImageLock {
        version: IMAGE_LOCK_VERSION.to_string(),
        image,
        digest,
    }
}

/// Hashes a skill path: a canonical file manifest for directories, the file
/// plus its capability contract for single files. Either way the contract
/// bytes participate, so editing the contract invalidates the capsule.
fn hash_skill_path(path: &Path) -> Result<String, LockError> {
    let meta = std::fs::metadata(path)?;
    let mut hasher = Sha256::new();
    if meta.is_dir() {
        // The contract lives inside the directory, so the manifest already
        // covers it.
        let entries = file_manifest(path, &[".git".to_string(), ".metaclaw".to_string()])?;
        for entry in &entries {
            hasher.update(entry.path.as_bytes());
            hasher.update(entry.sha256.as_bytes());
        }
    } else {
        let file_name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        hasher.update(file_name.as_bytes());
        hasher.update(sha256_file(path)?.as_bytes());
        if let Ok(Some(contract_path)) = capability::discover_contract_path(path) {
            let contract_name = contract_path
                .file_name()
                .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
            hasher.update(contract_name.as_bytes());
            hasher.update(sha256_file(&contract_path)?.as_bytes());
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn build_source_lock(root: &Path, excludes: &[String]) -> Result<SourceLock, LockError> {
    let (git_commit, git_tree) = git_metadata(root);
    let files = file_manifest(root, excludes)?;
    Ok(SourceLock {
        version: SOURCE_LOCK_VERSION.to_string(),
        git_commit,
        git_tree,
        files,
    })
}

/// Best-effort HEAD commit/tree via the `git` binary; absent outside a
/// worktree or when git is not installed.
fn git_metadata(root: &Path) -> (Option<String>, Option<String>) {
    let rev_parse = |spec: &str| -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(["rev-parse", spec])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    };
    match (rev_parse("HEAD"), rev_parse("HEAD^{tree}")) {
        (Some(commit), Some(tree)) => (Some(commit), Some(tree)),
        _ => {
            debug!(root = %root.display(), "no git metadata for source lock");
            (None, None)
        }
    }
}

/// Walks `root` and returns sorted (relative path, sha256) entries.
///
/// Symlinks are not followed into; a symlinked file is hashed through its
/// target after verifying the target stays inside `root`.
fn file_manifest(root: &Path, excludes: &[String]) -> Result<Vec<FileHash>, LockError> {
    let canonical_root = root.canonicalize()?;
    let mut out = Vec::new();
    let mut walker = WalkDir::new(root).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel_slash = slash_path(&rel);
        if entry.file_type().is_dir() {
            if is_excluded(&rel_slash, excludes) {
                walker.skip_current_dir();
            }
            continue;
        }
        if is_excluded(&rel_slash, excludes) {
            continue;
        }
        if entry.path_is_symlink() {
            let resolved = entry.path().canonicalize()?;
            if !resolved.starts_with(&canonical_root) {
                return Err(LockError::SymlinkEscape { path: rel_slash });
            }
            if !resolved.is_file() {
                continue;
            }
        }
        out.push(FileHash {
            path: rel_slash,
            sha256: sha256_file(entry.path())?,
        });
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn is_excluded(rel: &str, excludes: &[String]) -> bool {
    excludes.iter().any(|ex| {
        let ex = ex.trim_end_matches('/');
        !ex.is_empty() && ex != "." && (rel == ex || rel.starts_with(&format!("{ex}/")))
    })
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative path of `target` under `root`, or `None` when it lives outside.
fn relative_if_inside(root: &Path, target: &Path) -> Option<String> {
    let abs_root = std::path::absolute(root).ok()?;
    let abs_target = std::path::absolute(target).ok()?;
    let rel = abs_target.strip_prefix(&abs_root).ok()?;
    let rel_slash = slash_path(rel);
    (!rel_slash.is_empty()).then_some(rel_slash)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::claw::parse::parse_bytes;
    use crate::claw::schema::SkillRef;

    fn minimal_cfg() -> Clawfile {
        parse_bytes(
            b"apiVersion: metaclaw/v1\nkind: Agent\nagent:\n  name: l\n  species: nano\n",
            "agent.claw",
        )
        .unwrap()
    }

    #[test]
    fn image_lock_hashes_the_image_string() {
        let mut cfg = minimal_cfg();
        cfg.agent.runtime.image = Some("img@sha256:abc".to_string());
        let lock = build_image_lock(&cfg);
        assert_eq!(lock.version, IMAGE_LOCK_VERSION);
        assert_eq!(
            lock.digest,
            format!(
                "sha256:{}",
                hex::encode(Sha256::digest("img@sha256:abc".as_bytes()))
            )
        );
    }

    #[test]
    fn id_skill_digest_depends_on_version_and_digest() {
        let mut cfg = minimal_cfg();
        cfg.agent.skills.push(SkillRef {
            id: Some("summarize".to_string()),
            version: Some("1.0.0".to_string()),
            digest: Some("sha256:aaaa".to_string()),
            ..Default::default()
        });
        let base = Path::new(".");
        let a = build_deps_lock(&cfg, base).unwrap();
        let b = build_deps_lock(&cfg, base).unwrap();
        assert_eq!(a.skills[0].digest, b.skills[0].digest);

        cfg.agent.skills[0].version = Some("1.0.1".to_string());
        let c = build_deps_lock(&cfg, base).unwrap();
        assert_ne!(a.skills[0].digest, c.skills[0].digest);
    }

    #[test]
    fn deps_entries_are_sorted_by_stable_key() {
        let mut cfg = minimal_cfg();
        for id in ["zeta", "alpha"] {
            cfg.agent.skills.push(SkillRef {
                id: Some(id.to_string()),
                version: Some("1.0.0".to_string()),
                digest: Some("sha256:aa".to_string()),
                ..Default::default()
            });
        }
        let lock = build_deps_lock(&cfg, Path::new(".")).unwrap();
        assert_eq!(lock.skills[0].id.as_deref(), Some("alpha"));
        assert_eq!(lock.skills[1].id.as_deref(), Some("zeta"));
    }

    #[test]
    fn contract_edit_changes_path_skill_digest() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("skill");
        fs::create_dir(&skill).unwrap();
        fs::write(skill.join("run.sh"), "echo hi\n").unwrap();
        fs::write(
            skill.join("capability.contract.yaml"),
            "apiVersion: metaclaw.capability/v1\n",
        )
        .unwrap();

        let before = hash_skill_path(&skill).unwrap();
        fs::write(
            skill.join("capability.contract.yaml"),
            "apiVersion: metaclaw.capability/v1\n# edited\n",
        )
        .unwrap();
        let after = hash_skill_path(&skill).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn single_file_skill_digest_includes_sibling_contract() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("run.sh");
        fs::write(&skill, "echo hi\n").unwrap();
        let without_contract = hash_skill_path(&skill).unwrap();

        fs::write(
            dir.path().join("capability.contract.yaml"),
            "apiVersion: metaclaw.capability/v1\n",
        )
        .unwrap();
        let with_contract = hash_skill_path(&skill).unwrap();
        assert_ne!(without_contract, with_contract);
    }

    #[test]
    fn source_lock_excludes_state_and_output_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("agent.claw"), "x").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(dir.path().join(".metaclaw")).unwrap();
        fs::write(dir.path().join(".metaclaw/state.db"), "db").unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/artifact"), "a").unwrap();
        fs::write(dir.path().join("main.py"), "print()\n").unwrap();

        let cfg = minimal_cfg();
        let locks = generate(&cfg, &dir.path().join("agent.claw"), &dir.path().join("out")).unwrap();
        let paths: Vec<&str> = locks.source.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["agent.claw", "main.py"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_source_root_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), "s").unwrap();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("agent.claw"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("leak"))
            .unwrap();

        let cfg = minimal_cfg();
        let err = generate(&cfg, &dir.path().join("agent.claw"), Path::new("/nonexistent-out"))
            .unwrap_err();
        assert!(matches!(err, LockError::SymlinkEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_source_root_is_hashed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), "content").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("alias.txt"))
            .unwrap();
        let files = file_manifest(dir.path(), &[]).unwrap();
        let alias = files.iter().find(|f| f.path == "alias.txt").unwrap();
        let real = files.iter().find(|f| f.path == "real.txt").unwrap();
        assert_eq!(alias.sha256, real.sha256);
    }
}
