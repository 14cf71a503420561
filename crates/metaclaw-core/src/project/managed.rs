//! Managed-file expansion and hashing.
//!
//! Managed patterns support exact paths, single-segment globs
//! (`*`, `?`, `[..]`), `dir/**`, and bare directory names which are
//! treated as `dir/**` for convenience.

use std::collections::BTreeMap;
use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use super::{ProjectError, MANIFEST_FILENAME};
use crate::canonical::sha256_file;

/// Expands the manifest patterns into a sorted, slash-separated list of
/// managed files under `template_dir`. User patterns always win.
///
/// # Errors
///
/// Pattern compile errors and walk failures.
pub fn expand_managed_files(
    template_dir: &Path,
    managed_patterns: &[String],
    user_patterns: &[String],
) -> Result<Vec<String>, ProjectError> {
    let managed_patterns = normalize_patterns(managed_patterns);
    let user_patterns = normalize_patterns(user_patterns);
    let managed_set = build_glob_set(&managed_patterns)?;
    let user_set = build_glob_set(&user_patterns)?;
    let managed_dirs = directory_prefixes(template_dir, &managed_patterns);

    let mut files = Vec::new();
    let mut walker = WalkDir::new(template_dir).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| ProjectError::Io {
            path: template_dir.display().to_string(),
            source: err.into(),
        })?;
        if entry.file_type().is_dir() {
            let name = entry.file_name().to_string_lossy();
            if name == ".git" || name == "__pycache__" {
                walker.skip_current_dir();
            }
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(".pyc") {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(template_dir)
            .unwrap_or(entry.path());
        let rel_slash = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel_slash == MANIFEST_FILENAME {
            continue;
        }
        if user_set.is_match(&rel_slash) {
            continue;
        }
        if managed_set.is_match(&rel_slash)
            || managed_dirs
                .iter()
                .any(|dir| rel_slash == *dir || rel_slash.starts_with(&format!("{dir}/")))
        {
            files.push(rel_slash);
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Hashes the given managed relative paths under `project_dir`.
///
/// # Errors
///
/// I/O errors on any listed file.
pub fn hash_managed_files(
    project_dir: &Path,
    managed: &[String],
) -> Result<BTreeMap<String, String>, ProjectError> {
    let mut out = BTreeMap::new();
    for rel in managed {
        let dst = project_dir.join(rel);
        let sum = sha256_file(&dst).map_err(|source| ProjectError::Io {
            path: dst.display().to_string(),
            source,
        })?;
        out.insert(rel.clone(), sum);
    }
    Ok(out)
}

fn normalize_patterns(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter_map(|raw| {
            let pattern = raw
                .trim()
                .trim_start_matches("./")
                .trim_end_matches('/')
                .to_string();
            (!pattern.is_empty()).then_some(pattern)
        })
        .collect()
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, ProjectError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // `*` must not cross path separators; `**` stays recursive.
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Bare directory names (no glob characters) act as `dir/**`.
fn directory_prefixes(template_dir: &Path, patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter(|p| !p.contains(['*', '?', '[']))
        .filter(|p| template_dir.join(p).is_dir())
        .cloned()
        .collect()
}
