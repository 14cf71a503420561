//! The project lock: which template is installed and the hash of every
//! managed file as of the last init/upgrade.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::ProjectError;

/// Lock file name under the host data dir.
pub const LOCK_FILENAME: &str = "project.lock.json";

/// Where a template comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSourceKind {
    /// A directory on the local filesystem.
    Local,
    /// A git repository (shallow-cloned and cached).
    Git,
}

/// A template source, persisted so upgrades re-resolve deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSource {
    /// Local or git.
    pub kind: TemplateSourceKind,
    /// Local directory, for [`TemplateSourceKind::Local`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Repository URL, for [`TemplateSourceKind::Git`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Git ref (branch or tag); defaults to `main`.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Subdirectory within the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The lock document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectLock {
    /// Always 1.
    pub schema_version: u32,
    /// The installed template source.
    pub template: TemplateSource,
    /// Manifest id of the installed template.
    pub template_id: String,
    /// Git commit of the template at install/upgrade time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_commit: Option<String>,
    /// RFC3339 install/upgrade timestamp.
    pub installed_at_utc: String,
    /// Managed relative path → sha256 at last init/upgrade.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub managed_files: BTreeMap<String, String>,
}

/// The default host data dir for a project.
#[must_use]
pub fn default_host_data_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".metaclaw")
}

/// Lock file path under a host data dir.
#[must_use]
pub fn lock_path(host_data_dir: &Path) -> PathBuf {
    host_data_dir.join(LOCK_FILENAME)
}

/// Loads and validates the lock.
///
/// # Errors
///
/// I/O, decode, schema-version, and missing-id errors.
pub fn load_lock(host_data_dir: &Path) -> Result<ProjectLock, ProjectError> {
    let path = lock_path(host_data_dir);
    let bytes = fs::read(&path).map_err(|source| ProjectError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut lock: ProjectLock =
        serde_json::from_slice(&bytes).map_err(|source| ProjectError::LockParse {
            path: path.display().to_string(),
            source,
        })?;
    if lock.schema_version == 0 {
        lock.schema_version = 1;
    }
    if lock.schema_version != 1 {
        return Err(ProjectError::LockSchemaVersion(lock.schema_version));
    }
    if lock.template_id.is_empty() {
        return Err(ProjectError::LockTemplateIdRequired(
            path.display().to_string(),
        ));
    }
    Ok(lock)
}

/// Writes the lock atomically (temp file plus rename).
///
/// # Errors
///
/// I/O errors.
pub fn write_lock(host_data_dir: &Path, mut lock: ProjectLock) -> Result<(), ProjectError> {
    if lock.schema_version == 0 {
        lock.schema_version = 1;
    }
    if lock.installed_at_utc.is_empty() {
        lock.installed_at_utc = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    fs::create_dir_all(host_data_dir).map_err(|source| ProjectError::Io {
        path: host_data_dir.display().to_string(),
        source,
    })?;
    let mut bytes = serde_json::to_vec_pretty(&lock).expect("lock serialization is infallible");
    bytes.push(b'\n');

    let path = lock_path(host_data_dir);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(|source| ProjectError::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, &path).map_err(|source| ProjectError::Io {
        path: path.display().to_string(),
        source,
    })
}
