//! Project template management: install a template, then upgrade its
//! managed files against a stored hash lock with three-way conflict
//! detection.

mod init;
mod lock;
mod managed;
mod manifest;
mod source;
mod upgrade;

pub use init::{init, InitOptions, InitResult};
pub use lock::{
    default_host_data_dir, load_lock, lock_path, write_lock, ProjectLock, TemplateSource,
    TemplateSourceKind, LOCK_FILENAME,
};
pub use managed::{expand_managed_files, hash_managed_files};
pub use manifest::{load_manifest, TemplateManifest, MANIFEST_FILENAME};
pub use source::{resolve_template, ResolvedTemplate};
pub use upgrade::{upgrade, UpgradeOptions, UpgradeResult};

use thiserror::Error;

/// Errors produced by template install and upgrade.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// Filesystem failure.
    #[error("project io ({path}): {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The template carries no manifest file.
    #[error("template manifest missing: {0}")]
    ManifestMissing(String),

    /// The manifest failed to decode.
    #[error("parse manifest {path}: {source}")]
    ManifestParse {
        /// Offending path.
        path: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// Unsupported manifest schema version.
    #[error("unsupported manifest schemaVersion {0}")]
    ManifestSchemaVersion(u32),

    /// The manifest lacks an id.
    #[error("manifest id is required ({0})")]
    ManifestIdRequired(String),

    /// The manifest manages nothing.
    #[error("manifest managed list is empty ({0})")]
    ManifestManagedEmpty(String),

    /// The project lock failed to decode.
    #[error("parse lock {path}: {source}")]
    LockParse {
        /// Offending path.
        path: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// Unsupported lock schema version.
    #[error("unsupported lock schemaVersion {0}")]
    LockSchemaVersion(u32),

    /// The lock lacks a template id.
    #[error("lock templateId is required ({0})")]
    LockTemplateIdRequired(String),

    /// A local template source has no directory.
    #[error("template source dir is empty")]
    TemplateDirEmpty,

    /// The template directory does not exist or is not a directory.
    #[error("template dir not accessible: {0}")]
    TemplateDirInvalid(String),

    /// A git template source has no repo URL.
    #[error("template source repo is empty")]
    TemplateRepoEmpty,

    /// The git template subpath is missing or escapes the repository.
    #[error("invalid template path {0:?}")]
    TemplatePathInvalid(String),

    /// Git is required for git template sources.
    #[error("git not found (required for git template sources)")]
    GitMissing,

    /// Shallow clone failed.
    #[error("git clone failed (repo={0})")]
    GitCloneFailed(String),

    /// Templates must not contain symlinks.
    #[error("symlinks are not supported in templates ({0})")]
    SymlinkUnsupported(String),

    /// A managed source entry is not a regular file.
    #[error("not a regular file: {0}")]
    NotRegularFile(String),

    /// Init refuses a non-empty project directory without `--force`.
    #[error("project dir is not empty: {dir} (unexpected: {unexpected}; use --force to continue)")]
    ProjectDirNotEmpty {
        /// The project directory.
        dir: String,
        /// Comma-joined unexpected entries.
        unexpected: String,
    },

    /// The managed patterns matched no files at all.
    #[error("manifest managed patterns matched 0 files")]
    ManagedMatchedNothing,

    /// A managed glob pattern failed to compile.
    #[error("invalid managed pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// Upgrade found conflicts and `--force` was not supplied.
    #[error("upgrade has conflicts ({0} files); re-run with --force to overwrite or resolve locally")]
    UpgradeConflicts(usize),

    /// A required option is missing.
    #[error("{0} is required")]
    OptionRequired(&'static str),
}
