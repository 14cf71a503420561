//! Template source resolution: local directories and cached git clones.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ProjectError, TemplateSource, TemplateSourceKind};

/// A resolved, on-disk template.
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    /// Directory holding the template contents.
    pub dir: PathBuf,
    /// Git commit when the source is a repository.
    pub commit: Option<String>,
}

/// Resolves a template source to a local directory.
///
/// Git sources are shallow-cloned into the OS cache directory and
/// refreshed best-effort, so cached templates keep working offline.
///
/// # Errors
///
/// Missing/invalid source fields, missing git, clone failures.
pub fn resolve_template(source: &TemplateSource) -> Result<ResolvedTemplate, ProjectError> {
    match source.kind {
        TemplateSourceKind::Local => {
            let dir = source
                .dir
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .ok_or(ProjectError::TemplateDirEmpty)?;
            let abs = std::path::absolute(dir).map_err(|source| ProjectError::Io {
                path: dir.to_string(),
                source,
            })?;
            if !abs.is_dir() {
                return Err(ProjectError::TemplateDirInvalid(abs.display().to_string()));
            }
            Ok(ResolvedTemplate {
                dir: abs,
                commit: None,
            })
        }
        TemplateSourceKind::Git => resolve_git_template(source),
    }
}

fn resolve_git_template(source: &TemplateSource) -> Result<ResolvedTemplate, ProjectError> {
    let repo = source
        .repo
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or(ProjectError::TemplateRepoEmpty)?;
    let git_ref = source
        .git_ref
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("main");
    let sub = source
        .path
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if sub.is_empty() || sub == "." || sub.starts_with("..") || sub.starts_with('/') {
        return Err(ProjectError::TemplatePathInvalid(sub.to_string()));
    }
    if !git_available() {
        return Err(ProjectError::GitMissing);
    }

    let cache_root = template_cache_root();
    let repo_dir = cache_root.join("git").join(repo_cache_key(repo));
    if let Some(parent) = repo_dir.parent() {
        fs::create_dir_all(parent).map_err(|source| ProjectError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }

    if repo_dir.exists() {
        // Offline users keep working against the cached copy.
        sync_git_repo(&repo_dir, git_ref);
    } else {
        clone_shallow(repo, &repo_dir)?;
        sync_git_repo(&repo_dir, git_ref);
    }

    let dir = repo_dir.join(sub);
    if !dir.is_dir() {
        return Err(ProjectError::TemplateDirInvalid(dir.display().to_string()));
    }
    let commit = git_rev_parse(&repo_dir, "HEAD");
    Ok(ResolvedTemplate { dir, commit })
}

fn template_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map_or_else(
            || std::env::temp_dir().join("metaclaw-templates-cache"),
            |cache| cache.join("metaclaw").join("templates"),
        )
}

fn repo_cache_key(repo: &str) -> String {
    hex::encode(&Sha256::digest(repo.as_bytes())[..8])
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn clone_shallow(repo: &str, dst: &Path) -> Result<(), ProjectError> {
    let status = Command::new("git")
        .args(["clone", "--depth", "1", repo])
        .arg(dst)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| ProjectError::Io {
            path: dst.display().to_string(),
            source,
        })?;
    if !status.success() {
        return Err(ProjectError::GitCloneFailed(repo.to_string()));
    }
    Ok(())
}

/// Quiet, best-effort refresh of a cached clone.
fn sync_git_repo(repo_dir: &Path, git_ref: &str) {
    for args in [
        vec!["fetch", "--prune", "--depth", "1", "origin", git_ref],
        vec!["reset", "--hard", &format!("origin/{git_ref}")],
        vec!["clean", "-fdx"],
    ] {
        let result = Command::new("git")
            .arg("-C")
            .arg(repo_dir)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !result.map(|s| s.success()).unwrap_or(false) {
            debug!(repo = %repo_dir.display(), "template sync step failed; using cached copy");
            return;
        }
    }
}

fn git_rev_parse(repo_dir: &Path, spec: &str) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_dir)
        .args(["rev-parse", spec])
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
