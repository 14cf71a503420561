//! Template installation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use walkdir::WalkDir;

use super::{
    expand_managed_files, hash_managed_files, load_manifest, resolve_template, write_lock,
    ProjectError, ProjectLock, TemplateSource, MANIFEST_FILENAME,
};

/// Options for [`init`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Directory to install into.
    pub project_dir: PathBuf,
    /// Host data dir; defaults to `<project>/.metaclaw`.
    pub host_data_dir: Option<PathBuf>,
    /// Where the template comes from.
    pub template: TemplateSource,
    /// Allow installing into a non-empty directory.
    pub force: bool,
}

/// What [`init`] produced.
#[derive(Debug, Clone)]
pub struct InitResult {
    /// Template manifest id.
    pub template_id: String,
    /// Template git commit, when any.
    pub template_commit: Option<String>,
    /// Number of files copied.
    pub created_files: usize,
}

/// Installs a template into a project directory and writes the lock.
///
/// # Errors
///
/// Non-empty project dir without `force`, template resolution/copy
/// failures, symlinks in the template.
pub fn init(opts: &InitOptions) -> Result<InitResult, ProjectError> {
    if opts.project_dir.as_os_str().is_empty() {
        return Err(ProjectError::OptionRequired("project dir"));
    }
    let project_dir = absolute(&opts.project_dir)?;
    let host_data_dir = match &opts.host_data_dir {
        Some(dir) => absolute(dir)?,
        None => super::default_host_data_dir(&project_dir),
    };

    fs::create_dir_all(&project_dir).map_err(|source| ProjectError::Io {
        path: project_dir.display().to_string(),
        source,
    })?;
    if !opts.force {
        ensure_project_dir_empty(&project_dir)?;
    }

    let resolved = resolve_template(&opts.template)?;
    let manifest = load_manifest(&resolved.dir)?;

    let created_files = copy_template_dir(&resolved.dir, &project_dir)?;

    let managed = expand_managed_files(&resolved.dir, &manifest.managed, &manifest.user)?;
    let managed_hashes = hash_managed_files(&project_dir, &managed)?;

    write_lock(
        &host_data_dir,
        ProjectLock {
            schema_version: 1,
            template: opts.template.clone(),
            template_id: manifest.id.clone(),
            template_commit: resolved.commit.clone(),
            installed_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            managed_files: managed_hashes,
        },
    )?;

    Ok(InitResult {
        template_id: manifest.id,
        template_commit: resolved.commit,
        created_files,
    })
}

fn ensure_project_dir_empty(project_dir: &Path) -> Result<(), ProjectError> {
    let entries = fs::read_dir(project_dir).map_err(|source| ProjectError::Io {
        path: project_dir.display().to_string(),
        source,
    })?;
    let mut unexpected: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != ".DS_Store")
        .collect();
    if unexpected.is_empty() {
        return Ok(());
    }
    unexpected.sort();
    Err(ProjectError::ProjectDirNotEmpty {
        dir: project_dir.display().to_string(),
        unexpected: unexpected.join(", "),
    })
}

/// Copies the template, skipping `.git` and the manifest itself.
/// Symlinks are rejected outright.
fn copy_template_dir(src_dir: &Path, dst_dir: &Path) -> Result<usize, ProjectError> {
    let mut created = 0;
    let mut walker = WalkDir::new(src_dir).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| ProjectError::Io {
            path: src_dir.display().to_string(),
            source: err.into(),
        })?;
        let rel = entry.path().strip_prefix(src_dir).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            if entry.file_name().to_string_lossy() == ".git" {
                walker.skip_current_dir();
                continue;
            }
            let target = dst_dir.join(rel);
            fs::create_dir_all(&target).map_err(|source| ProjectError::Io {
                path: target.display().to_string(),
                source,
            })?;
            continue;
        }
        if entry.path_is_symlink() {
            return Err(ProjectError::SymlinkUnsupported(
                entry.path().display().to_string(),
            ));
        }
        if rel.to_string_lossy() == MANIFEST_FILENAME {
            // The lock records the template metadata; copying the manifest
            // would just invite confusion about which copy is live.
            continue;
        }
        super::upgrade::copy_file_preserve_mode(entry.path(), &dst_dir.join(rel))?;
        created += 1;
    }
    Ok(created)
}

fn absolute(path: &Path) -> Result<PathBuf, ProjectError> {
    std::path::absolute(path).map_err(|source| ProjectError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::TemplateSourceKind;

    fn template_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILENAME),
            r#"{"id": "starter", "managed": ["README.md"]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "readme v1").unwrap();
        fs::write(dir.path().join("notes.txt"), "user notes").unwrap();
        dir
    }

    fn local_source(dir: &Path) -> TemplateSource {
        TemplateSource {
            kind: TemplateSourceKind::Local,
            dir: Some(dir.display().to_string()),
            repo: None,
            git_ref: None,
            path: None,
        }
    }

    #[test]
    fn init_copies_files_and_writes_lock() {
        let template = template_dir();
        let project = tempfile::tempdir().unwrap();
        let project_dir = project.path().join("app");

        let result = init(&InitOptions {
            project_dir: project_dir.clone(),
            host_data_dir: None,
            template: local_source(template.path()),
            force: false,
        })
        .unwrap();

        assert_eq!(result.template_id, "starter");
        assert_eq!(result.created_files, 2);
        assert!(project_dir.join("README.md").is_file());
        assert!(!project_dir.join(MANIFEST_FILENAME).exists());

        let lock = super::super::load_lock(&project_dir.join(".metaclaw")).unwrap();
        assert_eq!(lock.template_id, "starter");
        assert!(lock.managed_files.contains_key("README.md"));
        assert!(!lock.managed_files.contains_key("notes.txt"));
    }

    #[test]
    fn init_refuses_non_empty_project_dir() {
        let template = template_dir();
        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join("existing.txt"), "x").unwrap();

        let err = init(&InitOptions {
            project_dir: project.path().to_path_buf(),
            host_data_dir: None,
            template: local_source(template.path()),
            force: false,
        })
        .unwrap_err();
        assert!(matches!(err, ProjectError::ProjectDirNotEmpty { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn init_rejects_template_symlinks() {
        let template = template_dir();
        std::os::unix::fs::symlink(
            template.path().join("README.md"),
            template.path().join("link.md"),
        )
        .unwrap();
        let project = tempfile::tempdir().unwrap();

        let err = init(&InitOptions {
            project_dir: project.path().join("app"),
            host_data_dir: None,
            template: local_source(template.path()),
            force: false,
        })
        .unwrap_err();
        assert!(matches!(err, ProjectError::SymlinkUnsupported(_)));
    }
}
