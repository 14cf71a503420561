//! Three-way template upgrade against the project lock.
//!
//! For each managed path: identical template and project copies are
//! skipped; a project file that diverged from the lock is a conflict (or
//! is backed up and overwritten under `--force`); otherwise the template
//! copy wins. The lock only advances when no unresolved conflict remains.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};

use super::{
    expand_managed_files, load_lock, load_manifest, resolve_template, write_lock, ProjectError,
    ProjectLock, TemplateSource,
};
use crate::canonical::sha256_file;

/// Options for [`upgrade`].
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Project directory to upgrade.
    pub project_dir: PathBuf,
    /// Host data dir; defaults to `<project>/.metaclaw`.
    pub host_data_dir: Option<PathBuf>,
    /// Template to upgrade from.
    pub template: TemplateSource,
    /// Overwrite divergent files (after backing them up).
    pub force: bool,
    /// Classify only; write nothing.
    pub dry_run: bool,
}

/// Per-path classification of an upgrade.
#[derive(Debug, Clone, Default)]
pub struct UpgradeResult {
    /// Template manifest id.
    pub template_id: String,
    /// Template git commit, when any.
    pub template_commit: Option<String>,
    /// Paths overwritten with a newer template copy.
    pub updated: Vec<String>,
    /// Paths newly added from the template.
    pub added: Vec<String>,
    /// Paths already identical to the template.
    pub skipped: Vec<String>,
    /// Paths whose local edits blocked the upgrade.
    pub conflicts: Vec<String>,
}

/// Upgrades managed files and advances the lock.
///
/// # Errors
///
/// [`ProjectError::UpgradeConflicts`] when conflicts remain and `force`
/// was not supplied (non-conflicting files are still upgraded, the lock
/// is not advanced); resolution and I/O errors otherwise.
pub fn upgrade(opts: &UpgradeOptions) -> Result<UpgradeResult, ProjectError> {
    if opts.project_dir.as_os_str().is_empty() {
        return Err(ProjectError::OptionRequired("project dir"));
    }
    let project_dir = absolute(&opts.project_dir)?;
    let host_data_dir = match &opts.host_data_dir {
        Some(dir) => absolute(dir)?,
        None => super::default_host_data_dir(&project_dir),
    };

    // Absent/broken locks degrade to overwrite-without-conflict-detection.
    let lock = load_lock(&host_data_dir).ok();

    let resolved = resolve_template(&opts.template)?;
    let manifest = load_manifest(&resolved.dir)?;
    let managed = expand_managed_files(&resolved.dir, &manifest.managed, &manifest.user)?;
    if managed.is_empty() {
        return Err(ProjectError::ManagedMatchedNothing);
    }

    let backup_root = host_data_dir
        .join("upgrade-backups")
        .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    let mut result = UpgradeResult {
        template_id: manifest.id.clone(),
        template_commit: resolved.commit.clone(),
        ..Default::default()
    };
    let mut managed_hashes = lock
        .as_ref()
        .map(|l| l.managed_files.clone())
        .unwrap_or_default();

    for rel in &managed {
        let src = resolved.dir.join(rel);
        let dst = project_dir.join(rel);

        let template_hash = sha256_file(&src).map_err(|source| ProjectError::Io {
            path: src.display().to_string(),
            source,
        })?;
        let current_hash = match sha256_file(&dst) {
            Ok(hash) => Some(hash),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(ProjectError::Io {
                    path: dst.display().to_string(),
                    source,
                })
            }
        };

        match current_hash {
            None => {
                if !opts.dry_run {
                    copy_file_preserve_mode(&src, &dst)?;
                }
                managed_hashes.insert(rel.clone(), template_hash);
                result.added.push(rel.clone());
            }
            Some(current) if current == template_hash => {
                managed_hashes.insert(rel.clone(), current);
                result.skipped.push(rel.clone());
            }
            Some(current) => {
                let locally_modified = lock
                    .as_ref()
                    .and_then(|l| l.managed_files.get(rel))
                    .is_some_and(|prev| prev != &current);
                if locally_modified && !opts.force {
                    result.conflicts.push(rel.clone());
                    continue;
                }
                if !opts.dry_run {
                    if locally_modified {
                        backup_file(&dst, &backup_root.join(rel))?;
                    }
                    copy_file_preserve_mode(&src, &dst)?;
                }
                managed_hashes.insert(rel.clone(), template_hash);
                result.updated.push(rel.clone());
            }
        }
    }

    if opts.dry_run {
        return Ok(result);
    }
    if !result.conflicts.is_empty() && !opts.force {
        return Err(ProjectError::UpgradeConflicts(result.conflicts.len()));
    }

    write_lock(
        &host_data_dir,
        ProjectLock {
            schema_version: 1,
            template: opts.template.clone(),
            template_id: manifest.id,
            template_commit: resolved.commit,
            installed_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            managed_files: managed_hashes,
        },
    )?;
    Ok(result)
}

fn backup_file(src: &Path, dst: &Path) -> Result<(), ProjectError> {
    if !src.is_file() {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|source| ProjectError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    copy_file_preserve_mode(src, dst)
}

/// Atomic copy (temp + rename) preserving the source file mode.
pub(super) fn copy_file_preserve_mode(src: &Path, dst: &Path) -> Result<(), ProjectError> {
    let meta = fs::symlink_metadata(src).map_err(|source| ProjectError::Io {
        path: src.display().to_string(),
        source,
    })?;
    if meta.file_type().is_symlink() {
        return Err(ProjectError::SymlinkUnsupported(src.display().to_string()));
    }
    if !meta.is_file() {
        return Err(ProjectError::NotRegularFile(src.display().to_string()));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|source| ProjectError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let tmp = dst.with_extension("metaclaw-tmp");
    fs::copy(src, &tmp).map_err(|source| ProjectError::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, dst).map_err(|source| ProjectError::Io {
        path: dst.display().to_string(),
        source,
    })
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
    use crate::project::{init, InitOptions, TemplateSourceKind, MANIFEST_FILENAME};

    struct Fixture {
        template: tempfile::TempDir,
        project: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let template = tempfile::tempdir().unwrap();
            fs::write(
                template.path().join(MANIFEST_FILENAME),
                r#"{"id": "starter", "managed": ["README.md", "bot/**"]}"#,
            )
            .unwrap();
            fs::write(template.path().join("README.md"), "readme v1").unwrap();
            fs::create_dir_all(template.path().join("bot")).unwrap();
            fs::write(template.path().join("bot/main.py"), "print('v1')").unwrap();

            let project = tempfile::tempdir().unwrap();
            let fixture = Self { template, project };
            init(&InitOptions {
                project_dir: fixture.project_path(),
                host_data_dir: None,
                template: fixture.source(),
                force: true,
            })
            .unwrap();
            fixture
        }

        fn source(&self) -> TemplateSource {
            TemplateSource {
                kind: TemplateSourceKind::Local,
                dir: Some(self.template.path().display().to_string()),
                repo: None,
                git_ref: None,
                path: None,
            }
        }

        fn project_path(&self) -> PathBuf {
            self.project.path().to_path_buf()
        }

        fn upgrade(&self, force: bool, dry_run: bool) -> Result<UpgradeResult, ProjectError> {
            upgrade(&UpgradeOptions {
                project_dir: self.project_path(),
                host_data_dir: None,
                template: self.source(),
                force,
                dry_run,
            })
        }
    }

    #[test]
    fn identical_template_yields_all_skipped() {
        let fixture = Fixture::new();
        let result = fixture.upgrade(false, false).unwrap();
        assert_eq!(result.skipped.len(), 2);
        assert!(result.updated.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn bumped_template_file_yields_one_updated() {
        let fixture = Fixture::new();
        fs::write(fixture.template.path().join("README.md"), "readme v2").unwrap();

        let result = fixture.upgrade(false, false).unwrap();
        assert_eq!(result.updated, vec!["README.md"]);
        assert_eq!(result.skipped, vec!["bot/main.py"]);
        let upgraded = fs::read_to_string(fixture.project_path().join("README.md")).unwrap();
        assert_eq!(upgraded, "readme v2");
    }

    #[test]
    fn local_edit_yields_conflict_and_keeps_data() {
        let fixture = Fixture::new();
        fs::write(fixture.template.path().join("README.md"), "readme v2").unwrap();
        fs::write(fixture.project_path().join("README.md"), "my local edits").unwrap();

        let err = fixture.upgrade(false, false).unwrap_err();
        assert!(matches!(err, ProjectError::UpgradeConflicts(1)));
        let kept = fs::read_to_string(fixture.project_path().join("README.md")).unwrap();
        assert_eq!(kept, "my local edits");
    }

    #[test]
    fn force_backs_up_and_advances() {
        let fixture = Fixture::new();
        fs::write(fixture.template.path().join("README.md"), "readme v2").unwrap();
        fs::write(fixture.project_path().join("README.md"), "my local edits").unwrap();

        let result = fixture.upgrade(true, false).unwrap();
        assert_eq!(result.updated, vec!["README.md"]);
        assert_eq!(
            fs::read_to_string(fixture.project_path().join("README.md")).unwrap(),
            "readme v2"
        );

        let backups = fixture.project_path().join(".metaclaw/upgrade-backups");
        let backup_copy = walkdir::WalkDir::new(&backups)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_name() == "README.md")
            .expect("backup should exist");
        assert_eq!(
            fs::read_to_string(backup_copy.path()).unwrap(),
            "my local edits"
        );

        // Lock advanced: a rerun sees no conflict.
        let rerun = fixture.upgrade(false, false).unwrap();
        assert!(rerun.conflicts.is_empty());
    }

    #[test]
    fn dry_run_counts_without_writing() {
        let fixture = Fixture::new();
        fs::write(fixture.template.path().join("README.md"), "readme v2").unwrap();

        let result = fixture.upgrade(false, true).unwrap();
        assert_eq!(result.updated, vec!["README.md"]);
        assert_eq!(
            fs::read_to_string(fixture.project_path().join("README.md")).unwrap(),
            "readme v1"
        );
    }

    #[test]
    fn template_addition_is_added() {
        let fixture = Fixture::new();
        fs::write(fixture.template.path().join("bot/new.py"), "print('new')").unwrap();

        let result = fixture.upgrade(false, false).unwrap();
        assert_eq!(result.added, vec!["bot/new.py"]);
        assert!(fixture.project_path().join("bot/new.py").is_file());
    }
}
